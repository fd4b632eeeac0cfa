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

//! The value types of a mail transaction: who the peer is ([`Client`]), who
//! the mail is from and for ([`MailAddress`]), and the transaction itself
//! ([`Envelope`]).

use std::{fmt::Display, net::SocketAddr};

use chrono::Local;

/// The raw contents of the `<...>` brackets of a `MAIL FROM` or `RCPT TO`
/// argument.
///
/// No validation is performed beyond the bracket stripping done at parse
/// time: policy hooks see exactly what the client sent, including an empty
/// string for the null reverse-path (`MAIL FROM:<>`).
#[derive(PartialEq, Eq, Debug, Hash, Clone)]
pub struct MailAddress(String);

impl MailAddress {
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The address as the client sent it.
    #[must_use]
    pub fn email(&self) -> &str {
        &self.0
    }

    /// The part after the last `@`, lower-cased. Empty if the address has no
    /// `@`.
    #[must_use]
    pub fn hostname(&self) -> String {
        self.0
            .rfind('@')
            .map_or_else(String::new, |index| self.0[index + 1..].to_lowercase())
    }
}

impl Display for MailAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Which greeting form the client used ([RFC 5321 section
/// 4.1.1.1](https://www.rfc-editor.org/rfc/rfc5321.html#section-4.1.1.1)).
#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub enum HeloKind {
    Helo,
    Ehlo,
}

impl HeloKind {
    /// The transport tag recorded in the `Received:` header: `EHLO` signals
    /// ESMTP, `HELO` plain SMTP.
    #[must_use]
    pub const fn transport(self) -> &'static str {
        match self {
            Self::Helo => "SMTP",
            Self::Ehlo => "ESMTP",
        }
    }
}

/// What the receiver knows about the peer on the other end of a session.
///
/// Created when the connection is accepted and updated by the owning session
/// as the dialogue progresses; hooks receive it read-only.
#[derive(Debug, Clone)]
pub struct Client {
    pub(crate) addr: SocketAddr,
    pub(crate) helo_kind: Option<HeloKind>,
    pub(crate) helo_host: String,
    pub(crate) pregreeted: bool,
}

impl Client {
    pub(crate) const fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            helo_kind: None,
            helo_host: String::new(),
            pregreeted: false,
        }
    }

    /// The peer's network address.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The greeting form the client used, if it has greeted yet.
    #[must_use]
    pub const fn helo_kind(&self) -> Option<HeloKind> {
        self.helo_kind
    }

    /// The hostname the client claimed in its greeting. Empty before the
    /// greeting, or if the client sent a bare `HELO`.
    #[must_use]
    pub fn helo_host(&self) -> &str {
        &self.helo_host
    }

    /// Whether the client transmitted before the server finished its `220`
    /// greeting. This is a strong spam signal: [RFC 5321 section
    /// 3.1](https://www.rfc-editor.org/rfc/rfc5321.html#section-3.1)
    /// requires the client to wait for it.
    ///
    /// Only ever set when the server's pregreet probe is enabled.
    #[must_use]
    pub const fn pregreeted(&self) -> bool {
        self.pregreeted
    }
}

/// One SMTP mail transaction: the sender, the recipients, and the message
/// bytes, together with a snapshot of the [`Client`] that submitted it.
///
/// Built up by the session across `MAIL FROM`, `RCPT TO`, and `DATA`, then
/// handed to [`crate::Hooks::deliver`] and dropped. The snapshot is taken
/// when the transaction opens, so it carries the greeting identity and the
/// pregreet flag as they stood at `MAIL FROM`.
#[derive(Debug, Clone)]
pub struct Envelope {
    client: Client,
    sender: MailAddress,
    recipients: Vec<MailAddress>,
    data: Vec<u8>,
}

impl Envelope {
    pub(crate) const fn new(client: Client, sender: MailAddress) -> Self {
        Self {
            client,
            sender,
            recipients: Vec::new(),
            data: Vec::new(),
        }
    }

    /// The peer as it stood when the transaction opened.
    #[must_use]
    pub const fn client(&self) -> &Client {
        &self.client
    }

    /// The reverse-path from `MAIL FROM`.
    #[must_use]
    pub const fn sender(&self) -> &MailAddress {
        &self.sender
    }

    /// Every recipient accepted so far, in the order the client sent them.
    #[must_use]
    pub fn recipients(&self) -> &[MailAddress] {
        &self.recipients
    }

    /// The message bytes: the prepended `Received:` header followed by the
    /// body as received, dot-unstuffed, with the terminating `.\r\n`
    /// removed.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Consume the envelope, keeping only the message bytes.
    #[must_use]
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub(crate) fn add_recipient(&mut self, recipient: MailAddress) {
        self.recipients.push(recipient);
    }

    pub(crate) fn set_data(&mut self, data: Vec<u8>) {
        self.data = data;
    }

    /// Prepends the trace header described by [RFC 5321 section
    /// 4.4](https://www.rfc-editor.org/rfc/rfc5321.html#section-4.4),
    /// recording the claimed and actual peer identity, this server, the
    /// transport, the first recipient, and the date.
    ///
    /// The session guarantees at least one recipient before the body is
    /// read.
    pub(crate) fn add_received_header(&mut self, server_hostname: &str) {
        let header = format!(
            "Received: from {helo_host} [{peer}]\r\n\
             \tby {server_hostname} ({product} {version}) with {transport}\r\n\
             \tfor <{recipient}>; {date}\r\n",
            helo_host = self.client.helo_host,
            peer = self.client.addr,
            product = env!("CARGO_PKG_NAME"),
            version = env!("CARGO_PKG_VERSION"),
            transport = self.client.helo_kind.map_or("SMTP", HeloKind::transport),
            recipient = self.recipients[0].email(),
            date = Local::now().format("%a, %d %b %Y %H:%M:%S %z"),
        );

        let mut data = Vec::with_capacity(header.len() + self.data.len());
        data.extend_from_slice(header.as_bytes());
        data.append(&mut self.data);
        self.data = data;
    }
}
