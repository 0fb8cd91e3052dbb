//! Link-wide operations: reset, enumeration, group assignment and per-node housekeeping.
//!
//! Every operation is a sequence of [`Session`] primitives applied node by node in ascending node
//! order. Nothing is transactional: a failure on one node leaves the changes already made to other
//! nodes in place and names the node which failed.

use strum_macros::{Display, EnumString};

use crate::{
    accessor::parse_integer,
    clock::{Clock, Millis},
    commands::render,
    error::{Error, ErrorQueueEntry, ParseError, Result},
    node::{LinkTopology, NodeEntity, NodeNumber},
    session::{ExecuteResult, Session},
    status::{AwaitOutcome, ConditionBit, StatusByte},
    transport::Transport,
};

/// State reported by the link controller.
#[derive(Debug, Display, EnumString, Clone, Copy, PartialEq, Eq, Default)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum LinkState {
    /// Not read since the last reset.
    #[default]
    Unknown,
    Online,
    Offline,
}

/// Outcome of [`LinkCoordinator::collect_garbage`]. Device errors are reported, not raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GarbageReport {
    /// Last status byte read while waiting.
    pub status: StatusByte,
    /// Operation complete was seen within the timeout.
    pub completed: bool,
    /// The node did not signal completion in time. It may still complete later.
    pub timed_out: bool,
    pub errors: Vec<ErrorQueueEntry>,
}

/// Owns the topology of one link and drives link-wide operations through a session.
#[derive(Debug, Clone, Default)]
pub struct LinkCoordinator {
    topology: LinkTopology,
    state: LinkState,
}

impl LinkCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a topology known from an earlier run.
    pub fn with_topology(topology: LinkTopology) -> Self {
        Self {
            topology,
            state: LinkState::Unknown,
        }
    }

    pub fn topology(&self) -> &LinkTopology {
        &self.topology
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn node(&self, number: NodeNumber) -> Option<&NodeEntity> {
        self.topology.get(number)
    }

    pub fn node_mut(&mut self, number: NodeNumber) -> Option<&mut NodeEntity> {
        self.topology.get_mut(number)
    }

    pub fn controller(&self) -> &NodeEntity {
        self.topology.controller()
    }

    fn member<I: embedded_io::Error>(
        &self,
        number: NodeNumber,
    ) -> core::result::Result<&NodeEntity, Error<I>> {
        self.topology.get(number).ok_or(Error::InvalidNode(number.get()))
    }

    /// Arm operation complete, send `command` with the wait-complete suffix and wait for any of
    /// `conditions`.
    ///
    /// The event register is read first, so an operation complete latched by an earlier command
    /// cannot end the wait.
    fn run_to_completion<T: Transport, C: Clock>(
        session: &mut Session<T, C>,
        command: &str,
        conditions: &[ConditionBit],
        timeout: Millis,
    ) -> Result<AwaitOutcome, T::Error> {
        let stale = session.query_standard_events()?;
        if stale.operation_complete() {
            log::debug!("cleared a stale operation complete before `{command}`");
        }
        let commands = &session.config().commands;
        let arm = commands.arm_operation_complete.clone();
        let command = format!("{command}{}", commands.wait_complete_suffix);
        session.write_line(&arm)?;
        session.write_line(&command)?;
        session.settle();
        session.await_conditions(conditions, timeout)
    }

    /// Reset the link and rebuild the topology.
    ///
    /// On success the topology holds the controller plus every node up to `max_node_count` that
    /// answered the existence probe, each with its group assigned, and the error and data queues
    /// are empty. An offline link is accepted only when a single node is expected.
    ///
    /// The topology is left untouched when the reset times out, the link is offline or a probe
    /// fails. A failed group assignment keeps the new topology and the groups already assigned.
    pub fn reset_link<T: Transport, C: Clock>(
        &mut self,
        session: &mut Session<T, C>,
        timeout: Millis,
        max_node_count: u16,
    ) -> Result<&LinkTopology, T::Error> {
        if max_node_count == 0 || max_node_count > NodeNumber::MAX_LINK {
            return Err(Error::InvalidNode(max_node_count));
        }
        let commands = &session.config().commands;
        let reset = match &commands.link_reset {
            Some(template) => render(template, &[("count", &max_node_count)]),
            None => commands.reset_node.local.clone(),
        };

        log::info!("resetting link for up to {max_node_count} nodes");
        let outcome =
            Self::run_to_completion(session, &reset, &[ConditionBit::OperationComplete], timeout)?;
        if outcome.timed_out {
            return Err(Error::LinkResetTimeout {
                command: session.last_command().to_string(),
                timeout,
                status: outcome.status,
            });
        }
        // Reading the event register unlatches operation complete.
        let events = session.query_standard_events()?;
        if events.has_errors() {
            log::warn!("link reset latched error events {events:?}");
        }

        self.state = LinkState::Unknown;
        let state = self.refresh_link_state(session)?;
        if state != LinkState::Online && max_node_count > 1 {
            return Err(Error::LinkOffline {
                command: session.config().commands.link_state_query.clone().unwrap_or(reset),
                expected_nodes: max_node_count.into(),
                state,
            });
        }

        let controller = Self::query_controller_number(session)?;
        let mut topology = LinkTopology::new(controller);
        if max_node_count > 1 {
            for number in (1..=max_node_count).filter_map(NodeNumber::new) {
                if number == controller || !NodeEntity::probe_exists(session, number)? {
                    continue;
                }
                if !topology.insert(NodeEntity::remote(number)) {
                    return Err(Error::Topology("node reported twice"));
                }
            }
        }
        session.set_controller_node(controller);
        log::info!(
            "link {state}, controller {controller}, nodes {:?}",
            topology.numbers().map(|n| n.get()).collect::<Vec<_>>()
        );
        self.topology = topology;

        self.assign_groups(session)?;
        session.clear_error_queue(controller)?;
        let numbers: Vec<NodeNumber> = self.topology.numbers().collect();
        for number in numbers {
            self.clear_data_queue(session, number, false)?;
        }
        Ok(&self.topology)
    }

    fn query_controller_number<T: Transport, C: Clock>(
        session: &mut Session<T, C>,
    ) -> Result<NodeNumber, T::Error> {
        let Some(command) = session.config().commands.controller_node_query.clone() else {
            return Ok(session.controller_node());
        };
        let reply = session.query_line(&command)?;
        let number = parse_integer(&reply.received_text)
            .and_then(|n| u16::try_from(n).ok())
            .ok_or_else(|| ParseError::new(&command, &reply.received_text, "node number"))?;
        NodeNumber::new(number)
            .filter(|n| n.get() <= NodeNumber::MAX_LINK)
            .ok_or(Error::InvalidNode(number))
    }

    /// Give every node its own group, numbered after the node. Stops at the first failure.
    fn assign_groups<T: Transport, C: Clock>(
        &mut self,
        session: &mut Session<T, C>,
    ) -> Result<(), T::Error> {
        let Some(assign) = session.config().commands.assign_group.clone() else {
            return Ok(());
        };
        let ready_timeout = session.config().ready_timeout;
        let mut assigned = Vec::new();
        for entity in self.topology.iter_mut() {
            let number = entity.number();
            let group = number.get();
            let command = assign.for_node_with(number, entity.is_controller(), &[("group", &group)]);
            if let Err(e) = session.write_with_status_check(ready_timeout, &command) {
                log::warn!("group assignment for node {number} failed: {e}");
                return Err(Error::GroupAssignmentFailed {
                    node: number,
                    command,
                    assigned,
                    cause: Box::new(e),
                });
            }
            entity.set_group(group);
            assigned.push(number);
        }
        Ok(())
    }

    /// Re-read the link state from the controller. Families without a link are always offline.
    pub fn refresh_link_state<T: Transport, C: Clock>(
        &mut self,
        session: &mut Session<T, C>,
    ) -> Result<LinkState, T::Error> {
        let Some(command) = session.config().commands.link_state_query.clone() else {
            self.state = LinkState::Offline;
            return Ok(self.state);
        };
        let reply = session.query_line(&command)?;
        self.state = reply
            .received_text
            .trim()
            .parse()
            .map_err(|_| ParseError::new(&command, &reply.received_text, "link state"))?;
        Ok(self.state)
    }

    /// Read the identity of every known node that lacks one.
    pub fn initialize_nodes<T: Transport, C: Clock>(
        &mut self,
        session: &mut Session<T, C>,
    ) -> Result<(), T::Error> {
        for entity in self.topology.iter_mut() {
            entity.initialize_known_state(session)?;
        }
        Ok(())
    }

    /// Reset one node: a local reset on the controller, a node-addressed reset otherwise.
    pub fn reset_node<T: Transport, C: Clock>(
        &mut self,
        session: &mut Session<T, C>,
        node: NodeNumber,
    ) -> Result<ExecuteResult, T::Error> {
        let is_controller = self.member::<T::Error>(node)?.is_controller();
        let command = session.config().commands.reset_node.for_node(node, is_controller);
        log::info!("resetting node {node}");
        session.write_line(&command)
    }

    /// Clear the data queue of `node`, returning how many entries it held.
    ///
    /// The count is only read when `report_if_not_empty` is set; stale entries are logged.
    pub fn clear_data_queue<T: Transport, C: Clock>(
        &self,
        session: &mut Session<T, C>,
        node: NodeNumber,
        report_if_not_empty: bool,
    ) -> Result<usize, T::Error> {
        let is_controller = self.member::<T::Error>(node)?.is_controller();
        let commands = &session.config().commands;
        let (count_query, clear) = (commands.data_queue_count.clone(), commands.data_queue_clear.clone());
        let Some(clear) = clear else {
            return Ok(0);
        };

        let mut stale = 0;
        if let Some(count_query) = count_query.filter(|_| report_if_not_empty) {
            let command = count_query.for_node(node, is_controller);
            let reply = session.query_line(&command)?;
            stale = parse_integer(&reply.received_text)
                .and_then(|n| usize::try_from(n).ok())
                .ok_or_else(|| ParseError::new(&command, &reply.received_text, "integer"))?;
            if stale > 0 {
                log::warn!("node {node} data queue held {stale} stale entries");
            }
        }
        session.write_line(&clear.for_node(node, is_controller))?;
        Ok(stale)
    }

    /// Run the node's garbage collector and wait up to `timeout` for it to finish.
    pub fn collect_garbage<T: Transport, C: Clock>(
        &self,
        session: &mut Session<T, C>,
        node: NodeNumber,
        timeout: Millis,
    ) -> Result<GarbageReport, T::Error> {
        let is_controller = self.member::<T::Error>(node)?.is_controller();
        let Some(collect) = session.config().commands.collect_garbage.clone() else {
            return Ok(GarbageReport {
                status: session.read_status_byte()?,
                completed: true,
                timed_out: false,
                errors: Vec::new(),
            });
        };
        let command = collect.for_node(node, is_controller);
        let start = session.clock().now();
        let mut outcome = Self::run_to_completion(
            session,
            &command,
            &[ConditionBit::OperationComplete, ConditionBit::ErrorAvailable],
            timeout,
        )?;

        let mut errors = Vec::new();
        if session.is_set(outcome.status, ConditionBit::ErrorAvailable) {
            errors.extend(session.drain_from(node, outcome.status)?);
        }
        if !session.is_set(outcome.status, ConditionBit::OperationComplete) && !outcome.timed_out {
            // An error came first; completion is still outstanding.
            let remaining = timeout
                .checked_sub(session.clock().elapsed_since(start))
                .unwrap_or(Millis::millis(0));
            outcome = session.await_conditions(&[ConditionBit::OperationComplete], remaining)?;
            if session.is_set(outcome.status, ConditionBit::ErrorAvailable) {
                errors.extend(session.drain_from(node, outcome.status)?);
            }
        }

        let completed = session.is_set(outcome.status, ConditionBit::OperationComplete);
        if completed {
            session.query_standard_events()?;
        } else {
            log::warn!("garbage collection on node {node} did not finish within {timeout:?}");
        }
        Ok(GarbageReport {
            status: outcome.status,
            completed,
            timed_out: !completed,
            errors,
        })
    }
}
