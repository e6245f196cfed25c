//! Command envelope.
//!
//! The application-level schema is external: a command catalogue maps
//! command names to (package_type, sub_type, encoded payload) and to the
//! expected reply's (package_type, sub_type) where correlation is used.
//! This module carries that envelope plus the handful of ctrl commands the
//! link layer owns itself.

use std::time::Duration;

use bytes::Bytes;

use crate::protocol::{ctrl_sub, PackageType};

/// Expected reply selector for a correlated command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyMatch {
    /// Package type of the expected reply.
    pub package_type: PackageType,
    /// Sub-type of the expected reply.
    pub sub_type: u8,
}

/// One command as submitted to the dispatcher.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    /// Package type of the outbound frames.
    pub package_type: PackageType,
    /// Sub-type of the outbound frames.
    pub sub_type: u8,
    /// Encoded command payload; chunked by the dispatcher if it exceeds
    /// the link MTU.
    pub payload: Bytes,
    /// Expected reply, if the command is correlated. `None` resolves the
    /// result as soon as all frames are written (and acked, if required).
    pub reply: Option<ReplyMatch>,
    /// Request a link-level ack per outbound frame.
    pub ack_required: bool,
    /// Run the payload through the injected transform and set the
    /// encrypted bit.
    pub encrypted: bool,
    /// Append a checksum to each outbound frame.
    pub checksum: bool,
    /// Reply deadline override; the dispatcher default applies when unset.
    pub deadline: Option<Duration>,
}

impl CommandRequest {
    /// A data command with the given sub-type and payload.
    pub fn data(sub_type: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            package_type: PackageType::Data,
            sub_type,
            payload: payload.into(),
            reply: None,
            ack_required: false,
            encrypted: false,
            checksum: true,
            deadline: None,
        }
    }

    /// A ctrl command with the given sub-type and payload.
    pub fn ctrl(sub_type: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            package_type: PackageType::Ctrl,
            ..Self::data(sub_type, payload)
        }
    }

    /// Correlate with a reply of the same package type and sub-type.
    pub fn expect_echo_reply(self) -> Self {
        let reply = ReplyMatch {
            package_type: self.package_type,
            sub_type: self.sub_type,
        };
        self.expect_reply(reply)
    }

    /// Correlate with the given reply selector.
    pub fn expect_reply(mut self, reply: ReplyMatch) -> Self {
        self.reply = Some(reply);
        self
    }

    /// Require a link-level ack per outbound frame.
    pub fn with_ack(mut self) -> Self {
        self.ack_required = true;
        self
    }

    /// Encrypt the payload through the injected transform.
    pub fn with_encryption(mut self) -> Self {
        self.encrypted = true;
        self
    }

    /// Skip the per-frame checksum.
    pub fn without_checksum(mut self) -> Self {
        self.checksum = false;
        self
    }

    /// Override the reply deadline for this command.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// The keep-alive link-sync command.
///
/// Submitted autonomously by the dispatcher on its keep-alive interval,
/// subject to the same single-in-flight rule as everything else. The device
/// echoes it, which doubles as a link liveness probe.
pub fn link_sync() -> CommandRequest {
    CommandRequest::ctrl(ctrl_sub::SYNC, Bytes::new()).expect_echo_reply()
}

/// Best-effort final notice written while disconnecting.
pub fn goodbye_notice() -> CommandRequest {
    CommandRequest::ctrl(ctrl_sub::GOODBYE, Bytes::new())
}
