use crate::proto::frame::Frame;
use bytes::Bytes;

/// A command ready to be sent to a node.
///
/// Arguments added with [`key`](Cmd::key) are remembered as keys so the
/// router can compute the hash slot the command targets.
///
/// # Example
///
/// ```
/// use slotwise::Cmd;
///
/// let cmd = Cmd::new("SET").key("user:{42}").arg("value");
/// assert_eq!(cmd.keys().count(), 1);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    args: Vec<Bytes>,
    key_positions: Vec<usize>,
}

impl Cmd {
    /// Creates a new command with the given name.
    #[inline]
    pub fn new(name: impl Into<Bytes>) -> Self {
        Self {
            args: vec![name.into()],
            key_positions: Vec::new(),
        }
    }

    /// Appends a plain argument.
    #[inline]
    pub fn arg<T: Into<Bytes>>(mut self, arg: T) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends an argument that names a key.
    #[inline]
    pub fn key<T: Into<Bytes>>(mut self, key: T) -> Self {
        self.key_positions.push(self.args.len());
        self.args.push(key.into());
        self
    }

    /// The command name.
    pub fn name(&self) -> &[u8] {
        &self.args[0]
    }

    /// All arguments, name included.
    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    /// The key arguments in order.
    pub fn keys(&self) -> impl Iterator<Item = &Bytes> + '_ {
        self.key_positions.iter().map(move |&i| &self.args[i])
    }

    /// Converts the command to a RESP array frame.
    #[inline]
    pub fn to_frame(&self) -> Frame {
        Frame::Array(
            self.args
                .iter()
                .map(|b| Frame::BulkString(Some(b.clone())))
                .collect(),
        )
    }
}

/// Creates a PING command.
#[inline]
pub fn ping() -> Cmd {
    Cmd::new("PING")
}

/// Creates a GET command.
#[inline]
pub fn get(key: impl Into<Bytes>) -> Cmd {
    Cmd::new("GET").key(key)
}

/// Creates a SET command.
#[inline]
pub fn set(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Cmd {
    Cmd::new("SET").key(key).arg(value)
}

/// Creates a DEL command.
#[inline]
pub fn del(key: impl Into<Bytes>) -> Cmd {
    Cmd::new("DEL").key(key)
}

/// Creates an EXISTS command.
#[inline]
pub fn exists(key: impl Into<Bytes>) -> Cmd {
    Cmd::new("EXISTS").key(key)
}

/// Creates an MGET command. All keys must share one slot in a cluster.
#[inline]
pub fn mget<K: Into<Bytes>>(keys: impl IntoIterator<Item = K>) -> Cmd {
    keys.into_iter().fold(Cmd::new("MGET"), |cmd, key| cmd.key(key))
}

/// Creates an AUTH command with password only.
#[inline]
pub fn auth(password: impl Into<Bytes>) -> Cmd {
    Cmd::new("AUTH").arg(password)
}

/// Creates an AUTH command with username and password (ACL style).
#[inline]
pub fn auth_with_username(username: impl Into<Bytes>, password: impl Into<Bytes>) -> Cmd {
    Cmd::new("AUTH").arg(username).arg(password)
}
