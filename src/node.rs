//! Instruments on a TSP-Link and the topology they form.

use core::num::NonZeroU16;
use std::collections::BTreeMap;

use strum_macros::Display;

use crate::{
    accessor::parse_boolean,
    clock::Clock,
    commands::{NodeCommand, render},
    error::{ParseError, Result},
    session::Session,
    transport::Transport,
};

/// Node number on a link. Always positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeNumber(NonZeroU16);

impl NodeNumber {
    /// Node 1, the default number of a stand-alone instrument.
    pub const FIRST: Self = Self(NonZeroU16::MIN);

    /// Highest node number TSP-Link can address.
    pub const MAX_LINK: u16 = 64;

    pub const fn new(number: u16) -> Option<Self> {
        match NonZeroU16::new(number) {
            Some(number) => Some(Self(number)),
            None => None,
        }
    }

    pub const fn get(&self) -> u16 {
        self.0.get()
    }
}

impl core::fmt::Display for NodeNumber {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<NodeNumber> for u16 {
    fn from(value: NodeNumber) -> Self {
        value.get()
    }
}

/// Output interlock as last read from the node.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterlockState {
    #[default]
    Unknown,
    Engaged,
    Disengaged,
}

/// Identity and capability record for one instrument on the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEntity {
    number: NodeNumber,
    is_controller: bool,
    model_number: Option<String>,
    serial_number: Option<String>,
    firmware_version: Option<String>,
    interlock: InterlockState,
    group: Option<u16>,
}

impl NodeEntity {
    fn with_role(number: NodeNumber, is_controller: bool) -> Self {
        Self {
            number,
            is_controller,
            model_number: None,
            serial_number: None,
            firmware_version: None,
            interlock: InterlockState::Unknown,
            group: None,
        }
    }

    /// The node the transport talks to directly.
    pub fn controller(number: NodeNumber) -> Self {
        Self::with_role(number, true)
    }

    /// A node reached through the controller.
    pub fn remote(number: NodeNumber) -> Self {
        Self::with_role(number, false)
    }

    pub fn number(&self) -> NodeNumber {
        self.number
    }

    pub fn is_controller(&self) -> bool {
        self.is_controller
    }

    pub fn model_number(&self) -> Option<&str> {
        self.model_number.as_deref()
    }

    pub fn serial_number(&self) -> Option<&str> {
        self.serial_number.as_deref()
    }

    pub fn firmware_version(&self) -> Option<&str> {
        self.firmware_version.as_deref()
    }

    pub fn interlock(&self) -> InterlockState {
        self.interlock
    }

    /// Group assigned by the last link reset.
    pub fn group(&self) -> Option<u16> {
        self.group
    }

    pub(crate) fn set_group(&mut self, group: u16) {
        self.group = Some(group);
    }

    fn has_identity(&self) -> bool {
        self.model_number.is_some() && self.serial_number.is_some() && self.firmware_version.is_some()
    }

    /// Ask the link whether node `number` exists. Sends nothing that changes instrument state.
    ///
    /// Families without a link only know the controller.
    pub fn probe_exists<T: Transport, C: Clock>(
        session: &mut Session<T, C>,
        number: NodeNumber,
    ) -> Result<bool, T::Error> {
        let Some(probe) = session.config().commands.probe_node.as_deref() else {
            return Ok(session.is_controller(number));
        };
        let command = render(probe, &[("node", &number)]);
        let reply = session.query_line(&command)?;
        let exists = parse_boolean(&reply.received_text)
            .ok_or_else(|| ParseError::new(&command, &reply.received_text, "boolean"))?;
        log::debug!("node {number} {}", if exists { "present" } else { "absent" });
        Ok(exists)
    }

    fn query_field<T: Transport, C: Clock>(
        &self,
        session: &mut Session<T, C>,
        query: Option<NodeCommand>,
    ) -> Result<Option<String>, T::Error> {
        let Some(query) = query else {
            return Ok(None);
        };
        let command = query.for_node(self.number, self.is_controller);
        let reply = session.query_line(&command)?;
        Ok(Some(reply.received_text.trim().to_string()))
    }

    /// Populate the missing identity fields. Fields already known are left untouched.
    ///
    /// Uses the node-relative identity queries when the family has them; the controller falls back
    /// to parsing its `*IDN?` reply.
    pub fn initialize_known_state<T: Transport, C: Clock>(
        &mut self,
        session: &mut Session<T, C>,
    ) -> Result<(), T::Error> {
        if self.has_identity() {
            return Ok(());
        }
        let commands = &session.config().commands;
        let (model_query, serial_query, firmware_query) = (
            commands.model_query.clone(),
            commands.serial_number_query.clone(),
            commands.firmware_query.clone(),
        );

        if self.model_number.is_none() {
            self.model_number = self.query_field(session, model_query)?;
        }
        if self.serial_number.is_none() {
            self.serial_number = self.query_field(session, serial_query)?;
        }
        if self.firmware_version.is_none() {
            self.firmware_version = self.query_field(session, firmware_query)?;
        }

        if !self.has_identity() && self.is_controller {
            let identity = session.identity()?;
            let mut fields = identity.split(',').skip(1).map(|field| field.trim().to_string());
            let (model, serial, firmware) = (fields.next(), fields.next(), fields.next());
            self.model_number = self.model_number.take().or(model);
            self.serial_number = self.serial_number.take().or(serial);
            self.firmware_version = self.firmware_version.take().or(firmware);
        }
        log::debug!(
            "node {}: model {:?}, serial {:?}, firmware {:?}",
            self.number,
            self.model_number,
            self.serial_number,
            self.firmware_version
        );
        Ok(())
    }

    /// Forget and re-read the identity fields.
    pub fn reprobe<T: Transport, C: Clock>(
        &mut self,
        session: &mut Session<T, C>,
    ) -> Result<(), T::Error> {
        self.model_number = None;
        self.serial_number = None;
        self.firmware_version = None;
        self.initialize_known_state(session)
    }

    /// Read the interlock state. Stays `Unknown` for families which cannot report it.
    pub fn refresh_interlock<T: Transport, C: Clock>(
        &mut self,
        session: &mut Session<T, C>,
    ) -> Result<InterlockState, T::Error> {
        let Some(query) = session.config().commands.interlock_query.clone() else {
            return Ok(self.interlock);
        };
        let command = query.for_node(self.number, self.is_controller);
        let reply = session.query_line(&command)?;
        let engaged = parse_boolean(&reply.received_text)
            .ok_or_else(|| ParseError::new(&command, &reply.received_text, "boolean"))?;
        self.interlock = if engaged {
            InterlockState::Engaged
        } else {
            InterlockState::Disengaged
        };
        Ok(self.interlock)
    }
}

/// Known nodes of one link, ordered by number, with exactly one controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkTopology {
    nodes: BTreeMap<NodeNumber, NodeEntity>,
    controller: NodeNumber,
}

impl Default for LinkTopology {
    fn default() -> Self {
        Self::new(NodeNumber::FIRST)
    }
}

impl LinkTopology {
    /// A topology holding only the controller.
    pub fn new(controller: NodeNumber) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(controller, NodeEntity::controller(controller));
        Self { nodes, controller }
    }

    /// Add a node. Returns `false`, leaving the topology unchanged, when the number is taken or
    /// `node` claims to be a second controller.
    pub fn insert(&mut self, node: NodeEntity) -> bool {
        if node.is_controller() || self.nodes.contains_key(&node.number()) {
            return false;
        }
        self.nodes.insert(node.number(), node);
        true
    }

    pub fn controller(&self) -> &NodeEntity {
        &self.nodes[&self.controller]
    }

    pub fn controller_number(&self) -> NodeNumber {
        self.controller
    }

    pub fn get(&self, number: NodeNumber) -> Option<&NodeEntity> {
        self.nodes.get(&number)
    }

    pub fn get_mut(&mut self, number: NodeNumber) -> Option<&mut NodeEntity> {
        self.nodes.get_mut(&number)
    }

    pub fn contains(&self, number: NodeNumber) -> bool {
        self.nodes.contains_key(&number)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Never true; the controller is always a member.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node numbers in ascending order.
    pub fn numbers(&self) -> impl Iterator<Item = NodeNumber> + '_ {
        self.nodes.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeEntity> {
        self.nodes.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut NodeEntity> {
        self.nodes.values_mut()
    }
}
