//! Command routing.
//!
//! The router resolves the slot owner from the current partition snapshot,
//! submits the command on the pooled connection to that node and follows
//! `MOVED`/`ASK` redirects until the command has run `max_executions` times.

use std::sync::Arc;

use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::core::command::Cmd;
use crate::core::{Endpoint, Error, Result};
use crate::proto::frame::Frame;

use super::commands;
use super::options::ClusterOptions;
use super::partitions::PartitionTable;
use super::pool::ConnectionPool;
use super::redirect::{server_error, Redirect};
use super::slot::command_slot;

/// A command in flight together with its routing state.
#[derive(Debug, Clone)]
pub struct RoutedCommand {
    cmd: Cmd,
    slot: Option<u16>,
    target: Option<Endpoint>,
    executions: u32,
    max_executions: u32,
}

impl RoutedCommand {
    /// Wraps `cmd` for routing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CrossSlot`] if the keys of `cmd` hash to different
    /// slots.
    pub fn new(cmd: Cmd, max_executions: u32) -> Result<Self> {
        let slot = command_slot(&cmd)?;
        Ok(Self {
            cmd,
            slot,
            target: None,
            executions: 1,
            max_executions: max_executions.max(1),
        })
    }

    /// The wrapped command.
    pub fn command(&self) -> &Cmd {
        &self.cmd
    }

    /// The slot the command targets, `None` for keyless commands.
    pub fn slot(&self) -> Option<u16> {
        self.slot
    }

    /// The node the next execution goes to.
    pub fn target(&self) -> Option<&Endpoint> {
        self.target.as_ref()
    }

    /// How many times the command has been (or is being) executed.
    pub fn executions(&self) -> u32 {
        self.executions
    }

    /// Points the command at `target` for its first execution.
    pub fn resolve(&mut self, target: Endpoint) {
        self.target = Some(target);
    }

    /// Records a redirect to `target`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RedirectExhausted`] if another execution would exceed
    /// the ceiling. The counter is left unchanged in that case.
    pub fn redirect(&mut self, target: Endpoint) -> Result<()> {
        if self.executions >= self.max_executions {
            return Err(Error::RedirectExhausted {
                executions: self.executions,
                address: target.address(),
            });
        }
        self.executions += 1;
        self.target = Some(target);
        Ok(())
    }
}

/// The outcome of a routed command.
#[derive(Debug, Clone, PartialEq)]
pub struct Routed {
    /// The reply of the final execution.
    pub reply: Frame,
    /// Executions it took, redirects included; 1 means no redirect.
    pub executions: u32,
    /// The node that produced `reply`.
    pub address: String,
}

/// Routes commands to slot owners.
#[derive(Debug, Clone)]
pub struct Router {
    table: Arc<PartitionTable>,
    pool: Arc<ConnectionPool>,
    options: Arc<ClusterOptions>,
    moved: Arc<Notify>,
}

impl Router {
    /// Creates a router.
    ///
    /// `moved` is notified on every `MOVED` reply when the options ask for
    /// refresh on moved.
    pub fn new(
        table: Arc<PartitionTable>,
        pool: Arc<ConnectionPool>,
        options: Arc<ClusterOptions>,
        moved: Arc<Notify>,
    ) -> Self {
        Self {
            table,
            pool,
            options,
            moved,
        }
    }

    /// Where a command for `slot` goes first.
    ///
    /// Falls back to any usable known node, then to the first seed, when the
    /// slot has no known owner or the command is keyless.
    pub fn resolve(&self, slot: Option<u16>) -> Result<Endpoint> {
        let partitions = self.table.snapshot();
        if let Some(owner) = slot.and_then(|s| partitions.lookup(s)) {
            return Ok(owner.endpoint.clone());
        }
        if let Some(slot) = slot {
            debug!(slot, "no known owner for slot");
        }
        partitions
            .any_node()
            .map(|n| n.endpoint.clone())
            .or_else(|| self.options.seeds.first().cloned())
            .ok_or_else(|| Error::ClusterDown {
                message: "no known node".to_string(),
            })
    }

    /// Sends `cmd` to the node owning its slot, following redirects.
    ///
    /// # Errors
    ///
    /// - [`Error::CrossSlot`] before anything is sent, for multi-slot commands
    /// - [`Error::Connection`] if the target node cannot be reached
    /// - [`Error::RedirectExhausted`] once the execution ceiling is hit
    /// - [`Error::Server`]/[`Error::ClusterDown`] for other error replies
    pub async fn route(&self, cmd: Cmd) -> Result<Routed> {
        let mut routed = RoutedCommand::new(cmd, self.options.max_executions)?;
        routed.resolve(self.resolve(routed.slot())?);
        let mut asking = false;

        loop {
            let target = match routed.target() {
                Some(target) => target.clone(),
                None => self.resolve(routed.slot())?,
            };
            let reply = self.execute(&target, routed.command(), asking).await?;

            let message = match reply {
                Frame::Error(message) => message,
                reply => {
                    return Ok(Routed {
                        reply,
                        executions: routed.executions(),
                        address: target.address(),
                    })
                }
            };

            match Redirect::parse(&message) {
                Some(Redirect::Moved { slot, address }) => {
                    debug!(slot, from = %target, to = %address, executions = routed.executions(), "MOVED");
                    routed.redirect(self.options.endpoint_for(&address)?)?;
                    asking = false;
                    if self.options.refresh_on_moved {
                        self.moved.notify_one();
                    }
                }
                Some(Redirect::Ask { slot, address }) => {
                    debug!(slot, from = %target, to = %address, executions = routed.executions(), "ASK");
                    routed.redirect(self.options.endpoint_for(&address)?)?;
                    asking = true;
                }
                None => return Err(server_error(&message)),
            }
        }
    }

    /// One execution of `cmd` on `target`, preceded by `ASKING` if requested.
    async fn execute(&self, target: &Endpoint, cmd: &Cmd, asking: bool) -> Result<Frame> {
        let connection = self.pool.get(target).await?;
        let submission = if asking {
            connection.pipeline(vec![commands::asking(), cmd.clone()])
        } else {
            connection.pipeline(vec![cmd.clone()])
        };

        let timeout = self.options.command_timeout;
        let replies = match tokio::time::timeout(timeout, submission).await {
            Ok(Ok(replies)) => replies,
            Ok(Err(e)) => {
                warn!(address = %target, error = %e, "command failed");
                return Err(Error::connection(target.address(), e));
            }
            Err(_) => {
                return Err(Error::Timeout {
                    millis: timeout.as_millis() as u64,
                })
            }
        };
        replies.into_iter().last().ok_or_else(|| Error::Protocol {
            message: "missing reply".to_string(),
        })
    }
}
