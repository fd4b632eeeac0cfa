// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright © 2025 RemasteredArch
//
// This file is part of smtp_receiver.
//
// smtp_receiver is free software: you can redistribute it and/or modify it under the terms of the
// GNU Affero General Public License as published by the Free Software Foundation, either version
// 3 of the License, or (at your option) any later version.
//
// smtp_receiver is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY;
// without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See
// the GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License along with
// smtp_receiver. If not, see <https://www.gnu.org/licenses/>.

//! The policy surface of the receiver.
//!
//! The receiver itself accepts anything that is well-formed on the wire; all
//! acceptance decisions belong to the [`Hooks`] implementation the consumer
//! installs on its [`crate::Server`].

use async_trait::async_trait;
use thiserror::Error;

use crate::envelope::{Client, Envelope, MailAddress};

/// A rejection returned by a policy hook.
///
/// [`HookError::Reply`] carries a preformatted SMTP reply line which the
/// session writes to the client verbatim, letting the hook pick the code and
/// enhanced status. Any other failure is carried opaquely and answered with
/// the default reply of the operation that invoked the hook.
#[derive(Debug, Error)]
pub enum HookError {
    /// A complete SMTP reply line, e.g. `"550 5.7.1 IP address blacklisted"`,
    /// without the line ending.
    ///
    /// Bad things will happen on the wire if this is not a well-formed SMTP
    /// reply.
    #[error("{0}")]
    Reply(String),

    /// Any other failure. The client sees the invoking operation's default
    /// reply; the error itself is only logged.
    #[error("{0}")]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl HookError {
    /// Shorthand for [`HookError::Reply`].
    pub fn reply(line: impl Into<String>) -> Self {
        Self::Reply(line.into())
    }

    /// Shorthand for [`HookError::Other`].
    pub fn other(error: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Other(error.into())
    }
}

/// Policy callbacks invoked as a session progresses.
///
/// Every method defaults to acceptance, so implementors override only the
/// decisions they care about. Hooks for different sessions run concurrently;
/// an implementation must be safe to invoke from multiple tasks at once.
/// Hooks may suspend; the session waits, and its peer with it.
///
/// # Examples
///
/// ```rust
/// use smtp_receiver::{Client, HookError, Hooks, MailAddress};
///
/// struct LocalOnly;
///
/// #[async_trait::async_trait]
/// impl Hooks for LocalOnly {
///     async fn on_rcpt_to(&self, _client: &Client, rcpt: &MailAddress) -> Result<(), HookError> {
///         if rcpt.hostname() == "example.com" {
///             Ok(())
///         } else {
///             Err(HookError::reply("550 5.7.1 Relay access denied"))
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait Hooks: Send + Sync + 'static {
    /// Called once per accepted connection, before any bytes are written to
    /// the client. An error closes the connection: [`HookError::Reply`] is
    /// sent verbatim, anything else as `554 connection rejected`.
    async fn on_new_connection(&self, _client: &Client) -> Result<(), HookError> {
        Ok(())
    }

    /// Called per `MAIL FROM`. On an error no envelope is created and the
    /// client sees the hook's reply, or `550 5.0.0 unacceptable sender`.
    async fn on_mail_from(&self, _client: &Client, _from: &MailAddress) -> Result<(), HookError> {
        Ok(())
    }

    /// Called per `RCPT TO`. On an error the recipient is not appended to
    /// the envelope and the client sees the hook's reply, or `550 5.0.0
    /// unacceptable recipient`.
    async fn on_rcpt_to(&self, _client: &Client, _rcpt: &MailAddress) -> Result<(), HookError> {
        Ok(())
    }

    /// Called once the message body has been received, consuming the
    /// completed [`Envelope`]. On success the client sees `250 2.0.0 Ok:
    /// queued`; on an error the hook's reply, or the transient `450 4.3.0
    /// Service unavailable`. Either way the mail is gone once this returns;
    /// the receiver keeps no copy.
    async fn deliver(&self, _envelope: Envelope) -> Result<(), HookError> {
        Ok(())
    }
}

/// The no-policy policy: accepts every connection, sender, recipient, and
/// message, and discards delivered mail.
#[derive(PartialEq, Eq, Debug, Copy, Clone, Default)]
pub struct AcceptAll;

impl Hooks for AcceptAll {}
