//! Classification of error replies.
//!
//! The cluster answers with special error replies when a slot is not served
//! by the node that received the command:
//! - `MOVED <slot> <host>:<port>` - the slot now lives on another node
//! - `ASK <slot> <host>:<port>` - retry this one command on another node
//!   while the slot is being migrated
//! - `CLUSTERDOWN ...` - the cluster cannot serve the slot at all

use crate::core::Error;

/// A redirect reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Redirect {
    /// Permanent ownership change.
    Moved {
        /// The slot that moved.
        slot: u16,
        /// Address of the new owner.
        address: String,
    },
    /// One-shot redirect during migration.
    Ask {
        /// The slot being migrated.
        slot: u16,
        /// Address of the importing node.
        address: String,
    },
}

impl Redirect {
    /// Parses an error reply; `None` if it is not a well-formed redirect.
    pub fn parse(error_msg: &[u8]) -> Option<Self> {
        let msg = String::from_utf8_lossy(error_msg);
        let msg = msg.trim();

        if let Some(args) = msg.strip_prefix("MOVED ") {
            let (slot, address) = parse_redirect_args(args)?;
            return Some(Redirect::Moved { slot, address });
        }
        if let Some(args) = msg.strip_prefix("ASK ") {
            let (slot, address) = parse_redirect_args(args)?;
            return Some(Redirect::Ask { slot, address });
        }
        None
    }

    /// The address the redirect points at.
    pub fn address(&self) -> &str {
        match self {
            Redirect::Moved { address, .. } | Redirect::Ask { address, .. } => address,
        }
    }
}

/// Converts a non-redirect error reply into an [`Error`].
pub fn server_error(error_msg: &[u8]) -> Error {
    let msg = String::from_utf8_lossy(error_msg);
    let msg = msg.trim();

    if let Some(rest) = msg.strip_prefix("CLUSTERDOWN") {
        return Error::ClusterDown {
            message: rest.trim().to_string(),
        };
    }
    if msg.starts_with("CROSSSLOT") {
        return Error::CrossSlot;
    }
    Error::Server {
        message: msg.to_string(),
    }
}

/// Parses `"<slot> <host>:<port>"`.
fn parse_redirect_args(args: &str) -> Option<(u16, String)> {
    let mut parts = args.split_whitespace();
    let slot = parts.next()?.parse().ok()?;
    let address = parts.next()?.to_string();
    if parts.next().is_some() {
        return None;
    }
    Some((slot, address))
}
