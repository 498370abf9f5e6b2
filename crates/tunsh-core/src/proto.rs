//! Generated protobuf types and tonic stubs for the shell service, plus
//! constructors for the frames both sides exchange.

#![allow(missing_docs)]

tonic::include_proto!("tunsh.core.v1");

impl ShellMsg {
    /// Opening frame of a session.
    pub fn command(cmd: Cmd) -> Self {
        Self {
            r#type: ShellMsgType::Command as i32,
            data: Some(shell_msg::Data::Cmd(cmd)),
        }
    }

    /// Byte frame tagged with the stream it belongs to.
    pub fn io(kind: IoDataType, data: impl Into<Vec<u8>>) -> Self {
        Self {
            r#type: ShellMsgType::Io as i32,
            data: Some(shell_msg::Data::Io(IoData {
                r#type: kind as i32,
                data: data.into(),
            })),
        }
    }

    /// Window-size frame.
    pub fn resize(rows: i32, cols: i32) -> Self {
        Self {
            r#type: ShellMsgType::Resize as i32,
            data: Some(shell_msg::Data::Resize(WinSize { rows, cols })),
        }
    }

    /// Command carried by this frame; a missing payload reads as the default.
    pub fn into_cmd(self) -> Cmd {
        match self.data {
            Some(shell_msg::Data::Cmd(cmd)) => cmd,
            _ => Cmd::default(),
        }
    }

    /// IO payload, or `None` if the frame carries none.
    pub fn io_data(&self) -> Option<&IoData> {
        match &self.data {
            Some(shell_msg::Data::Io(io)) => Some(io),
            _ => None,
        }
    }

    /// Window size, zero if the frame carries none.
    pub fn win_size(&self) -> WinSize {
        match &self.data {
            Some(shell_msg::Data::Resize(size)) => *size,
            _ => WinSize::default(),
        }
    }
}

impl Cmd {
    /// Command for `path` with `args` and no launch attributes.
    pub fn new(path: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            path: path.into(),
            args: args.into_iter().map(Into::into).collect(),
            linux: None,
        }
    }
}
