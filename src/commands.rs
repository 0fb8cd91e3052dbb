//! Literal command strings for one instrument family.
//!
//! TSP (node-addressed Lua) and SCPI (flat) instruments share the exact same dialogue shape, only
//! the words differ. The words are injected through a [`CommandSet`] so the session and the link
//! coordinator never spell out a command themselves.
//!
//! Templates may contain the placeholders `{node}`, `{group}`, `{count}` and `{value}`.

use core::fmt::Display;

use crate::node::NodeNumber;

/// Substitute `{key}` placeholders in `template`.
pub fn render(template: &str, args: &[(&str, &dyn Display)]) -> String {
    args.iter().fold(template.to_string(), |text, (key, value)| {
        text.replace(&format!("{{{key}}}"), &value.to_string())
    })
}

/// A command which is spelled differently on the controller and on a node reached through it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeCommand {
    /// Form sent when the target is the controller node.
    pub local: String,
    /// Form sent for any other node; may use `{node}`.
    pub remote: String,
}

impl NodeCommand {
    pub fn new(local: impl Into<String>, remote: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            remote: remote.into(),
        }
    }

    /// Same text regardless of the target node.
    pub fn flat(command: impl Into<String>) -> Self {
        let command = command.into();
        Self {
            local: command.clone(),
            remote: command,
        }
    }

    /// Select and render the form for `node`.
    pub fn for_node(&self, node: NodeNumber, is_controller: bool) -> String {
        self.for_node_with(node, is_controller, &[])
    }

    /// Like [`NodeCommand::for_node`] with extra placeholders.
    pub fn for_node_with(
        &self,
        node: NodeNumber,
        is_controller: bool,
        args: &[(&str, &dyn Display)],
    ) -> String {
        let template = if is_controller { &self.local } else { &self.remote };
        let text = render(template, &[("node", &node)]);
        render(&text, args)
    }
}

/// Table of commands for an instrument family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSet {
    /// `*IDN?`-style identity query; reply is `vendor,model,serial,firmware`.
    pub identity_query: String,
    /// Clears the status model without resetting the instrument.
    pub clear_execution_state: String,
    /// Places a reply in the output queue once all pending operations complete.
    pub operation_complete_query: String,
    /// Reads (and clears) the standard event register.
    pub standard_event_query: String,
    /// Routes operation complete to a service request.
    pub arm_operation_complete: String,
    /// Appended to long running commands so completion raises the operation complete bit.
    pub wait_complete_suffix: String,
    pub error_count_query: NodeCommand,
    /// Pops the oldest error queue entry.
    pub next_error_query: NodeCommand,
    pub clear_error_queue: NodeCommand,
    pub reset_node: NodeCommand,
    pub model_query: Option<NodeCommand>,
    pub serial_number_query: Option<NodeCommand>,
    pub firmware_query: Option<NodeCommand>,
    /// Reply is a boolean: engaged or not.
    pub interlock_query: Option<NodeCommand>,
    /// Reply is `true` when the node exists. `None` for families without a link.
    pub probe_node: Option<String>,
    /// May use `{count}`, the number of expected nodes.
    pub link_reset: Option<String>,
    /// Reply is `online` or `offline`.
    pub link_state_query: Option<String>,
    /// Reply is the controller's own node number.
    pub controller_node_query: Option<String>,
    /// Uses `{group}`.
    pub assign_group: Option<NodeCommand>,
    pub data_queue_count: Option<NodeCommand>,
    pub data_queue_clear: Option<NodeCommand>,
    pub collect_garbage: Option<NodeCommand>,
}

impl Default for CommandSet {
    fn default() -> Self {
        Self::tsp()
    }
}

impl CommandSet {
    /// Keithley Test Script Processor instruments, linked over TSP-Link.
    pub fn tsp() -> Self {
        Self {
            identity_query: "*IDN?".into(),
            clear_execution_state: "*CLS".into(),
            operation_complete_query: "*OPC?".into(),
            standard_event_query: "print(status.standard.event)".into(),
            arm_operation_complete:
                "status.standard.enable = status.standard.OPC status.request_enable = status.ESB"
                    .into(),
            wait_complete_suffix: " waitcomplete() opc()".into(),
            error_count_query: NodeCommand::flat("print(errorqueue.count)"),
            next_error_query: NodeCommand::flat("print(errorqueue.next())"),
            clear_error_queue: NodeCommand::flat("errorqueue.clear()"),
            reset_node: NodeCommand::new("localnode.reset()", "node[{node}].reset()"),
            model_query: Some(NodeCommand::new(
                "print(localnode.model)",
                "print(node[{node}].model)",
            )),
            serial_number_query: Some(NodeCommand::new(
                "print(localnode.serialno)",
                "print(node[{node}].serialno)",
            )),
            firmware_query: Some(NodeCommand::new(
                "print(localnode.revision)",
                "print(node[{node}].revision)",
            )),
            interlock_query: Some(NodeCommand::new(
                "print(bit.test(status.measurement.condition, 14))",
                "print(bit.test(node[{node}].status.measurement.condition, 14))",
            )),
            probe_node: Some("print(node[{node}] ~= nil)".into()),
            link_reset: Some("tsplink.reset({count})".into()),
            link_state_query: Some("print(tsplink.state)".into()),
            controller_node_query: Some("print(tsplink.node)".into()),
            assign_group: Some(NodeCommand::new(
                "tsplink.group = {group}",
                "node[{node}].tsplink.group = {group}",
            )),
            data_queue_count: Some(NodeCommand::new(
                "print(dataqueue.count)",
                "print(node[{node}].dataqueue.count)",
            )),
            data_queue_clear: Some(NodeCommand::new(
                "dataqueue.clear()",
                "node[{node}].dataqueue.clear()",
            )),
            collect_garbage: Some(NodeCommand::new(
                "collectgarbage()",
                "node[{node}].execute(\"collectgarbage()\")",
            )),
        }
    }

    /// Flat SCPI instruments. There is no link, so every link command is absent and the topology
    /// always consists of the controller alone.
    pub fn scpi() -> Self {
        Self {
            identity_query: "*IDN?".into(),
            clear_execution_state: "*CLS".into(),
            operation_complete_query: "*OPC?".into(),
            standard_event_query: "*ESR?".into(),
            arm_operation_complete: "*ESE 1;*SRE 32".into(),
            wait_complete_suffix: ";*OPC".into(),
            error_count_query: NodeCommand::flat(":SYST:ERR:COUN?"),
            next_error_query: NodeCommand::flat(":SYST:ERR?"),
            clear_error_queue: NodeCommand::flat("*CLS"),
            reset_node: NodeCommand::flat("*RST"),
            model_query: None,
            serial_number_query: None,
            firmware_query: None,
            interlock_query: None,
            probe_node: None,
            link_reset: None,
            link_state_query: None,
            controller_node_query: None,
            assign_group: None,
            data_queue_count: None,
            data_queue_clear: None,
            collect_garbage: None,
        }
    }
}
