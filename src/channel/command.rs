use serde::Serialize;
use std::fmt;

/// Prefix marking a line as a remote command for the agent's interpreter
pub const COMMAND_PREFIX: &str = "***";

/// Variable the on-board program reads as "turn this many degrees"
pub const TURN_VARIABLE: &str = "angle";

/// Variable the on-board program reads as "drive this many millimetres"
pub const DISTANCE_VARIABLE: &str = "dist";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Move,
    Turn,
    SetVariable,
    Run,
    Stop,
    Light,
    LoadProgram,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandKind::Move => "move",
            CommandKind::Turn => "turn",
            CommandKind::SetVariable => "set_variable",
            CommandKind::Run => "run",
            CommandKind::Stop => "stop",
            CommandKind::Light => "light",
            CommandKind::LoadProgram => "load_program",
        };
        f.write_str(name)
    }
}

/// A single opcode with its parameters
#[derive(Clone, Debug, PartialEq)]
pub enum Instruction {
    /// Drive straight; negative is backwards
    Move { distance_mm: i32 },
    /// Rotate in place; positive is clockwise
    Turn { degrees: i32 },
    SetVariable { name: String, value: i64 },
    Run,
    Stop,
    Light { colour: String },
    /// Program text; must be the last instruction of a command
    LoadProgram { source: String },
}

impl Instruction {
    pub fn kind(&self) -> CommandKind {
        match self {
            Instruction::Move { .. } => CommandKind::Move,
            Instruction::Turn { .. } => CommandKind::Turn,
            Instruction::SetVariable { .. } => CommandKind::SetVariable,
            Instruction::Run => CommandKind::Run,
            Instruction::Stop => CommandKind::Stop,
            Instruction::Light { .. } => CommandKind::Light,
            Instruction::LoadProgram { .. } => CommandKind::LoadProgram,
        }
    }

    /// Wire text for this instruction
    pub fn encode(&self) -> String {
        match self {
            Instruction::Move { distance_mm } => format!("{}move {}", COMMAND_PREFIX, distance_mm),
            Instruction::Turn { degrees } => format!("{}turn {}", COMMAND_PREFIX, degrees),
            Instruction::SetVariable { name, value } => {
                format!("{}{}={}", COMMAND_PREFIX, name, value)
            }
            Instruction::Run => format!("{}run", COMMAND_PREFIX),
            Instruction::Stop => format!("{}stop", COMMAND_PREFIX),
            Instruction::Light { colour } => format!("{}p {}", COMMAND_PREFIX, colour),
            Instruction::LoadProgram { source } => format!("{}load\n{}", COMMAND_PREFIX, source),
        }
    }
}

/// A command for one agent: one or more instructions sent as one payload
#[derive(Clone, Debug, PartialEq)]
pub struct Command {
    pub agent_id: u32,
    instructions: Vec<Instruction>,
    /// Whether the agent will acknowledge completion on its status address
    pub require_ack: bool,
}

impl Command {
    pub fn new(agent_id: u32, instruction: Instruction) -> Self {
        Self {
            agent_id,
            instructions: vec![instruction],
            require_ack: false,
        }
    }

    /// Append another instruction to the same payload
    pub fn then(mut self, instruction: Instruction) -> Self {
        self.instructions.push(instruction);
        self
    }

    pub fn with_ack(mut self) -> Self {
        self.require_ack = true;
        self
    }

    /// Turn-then-drive via the on-board program's variables.
    ///
    /// Zero components are left out, so a turn on the spot is `drive(id, turn, 0)`.
    /// Returns None when both are zero: the program would have nothing to do
    /// and would never acknowledge. Chasing and homing only issue the combined
    /// form; see the arena machine.
    pub fn drive(agent_id: u32, turn_degrees: i32, distance_mm: i32) -> Option<Self> {
        let mut instructions = Vec::with_capacity(2);
        if turn_degrees != 0 {
            instructions.push(Instruction::SetVariable {
                name: TURN_VARIABLE.to_string(),
                value: turn_degrees as i64,
            });
        }
        if distance_mm != 0 {
            instructions.push(Instruction::SetVariable {
                name: DISTANCE_VARIABLE.to_string(),
                value: distance_mm as i64,
            });
        }

        if instructions.is_empty() {
            return None;
        }

        Some(Self {
            agent_id,
            instructions,
            require_ack: true,
        })
    }

    /// Kind of the leading instruction
    pub fn kind(&self) -> CommandKind {
        self.instructions[0].kind()
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Newline-joined wire text
    pub fn payload(&self) -> String {
        self.instructions
            .iter()
            .map(Instruction::encode)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Maps agent broker addresses onto command and status subjects
#[derive(Clone, Debug)]
pub struct Addressing {
    prefix: String,
}

impl Addressing {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Where commands for the agent are published
    pub fn command_address(&self, agent_address: &str) -> String {
        format!("{}.{}.cmd", self.prefix, agent_address)
    }

    /// Where the agent reports status and acknowledgements
    pub fn status_address(&self, agent_address: &str) -> String {
        format!("{}.{}.status", self.prefix, agent_address)
    }
}
