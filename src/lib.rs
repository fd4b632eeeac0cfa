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

//! # smtp_receiver
//!
//! smtp_receiver is a library for receiving SMTP messages and handing them to
//! caller-supplied policy hooks.
//!
//! # How It Works
//!
//! [`Server::serve`] accepts incoming TCP connections and spawns a task to drive each one through
//! the SMTP dialogue: greeting, `HELO`/`EHLO`, `MAIL FROM`, `RCPT TO`, `DATA`, and the transaction
//! bookkeeping between them. Policy lives entirely in the [`Hooks`] the consumer installs: each
//! hook can accept, reject with its own preformatted SMTP reply, or reject opaquely and let the
//! receiver pick the default reply. A completed message is handed to [`Hooks::deliver`] as an
//! in-memory [`Envelope`]; the receiver neither queues nor relays, and keeps no copy.
//!
//! Shutdown is cooperative: cancel the token passed to [`Server::serve`] and the accept loop stops
//! immediately, while live sessions finish their current command, answer `421`, and drain.
//!
//! ```no_run
//! use smtp_receiver::{AcceptAll, Server};
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> std::io::Result<()> {
//! let mut server = Server::new(AcceptAll);
//! server.with_addr("127.0.0.1:2525").with_hostname("mx.example.com");
//!
//! server.listen_and_serve(CancellationToken::new()).await
//! # }
//! ```
//!
//! For anything beyond protocol framing (spam scoring, relaying, storage), implement [`Hooks`]
//! and build it into the host application. smtp_receiver exists to handle the receiving half, and
//! it is up to the consumer to handle the rest.
//!
//! # Terminology
//!
//! smtp_receiver uses specific terminology (such as "client" and "server") as defined by [RFC 5321
//! section 2.3](https://www.rfc-editor.org/rfc/rfc5321.html#section-2.3). Pull requests and issues
//! to fix discrepancies are welcome.

#![warn(clippy::nursery, clippy::pedantic)]
#![cfg_attr(debug_assertions, allow(clippy::missing_errors_doc))]

use std::{io::Result, net::SocketAddr, sync::Arc, time::Duration};

use async_stream::try_stream;
use futures_core::stream::Stream;
use futures_util::{pin_mut, StreamExt};
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

mod connection;
mod envelope;
mod hook;
pub mod str;
#[cfg(test)]
mod test;
pub mod timeouts;

pub use envelope::{Client, Envelope, HeloKind, MailAddress};
pub use hook::{AcceptAll, HookError, Hooks};

/// The listen address used when none is configured: every interface, on the
/// standard SMTP port.
const DEFAULT_ADDR: &str = "0.0.0.0:25";

/// An SMTP receiver: the listen and timing configuration plus the policy
/// [`Hooks`] it consults.
///
/// Configuration is set through the `with_*` methods and is immutable once
/// serving begins; [`Server::serve`] consumes the value.
pub struct Server<H: Hooks> {
    addr: String,
    hostname: String,
    pub(crate) read_timeout: Option<Duration>,
    pub(crate) write_timeout: Option<Duration>,
    pub(crate) pregreet_delay: Option<Duration>,
    pub(crate) hooks: H,
}

impl<H: Hooks> Server<H> {
    /// Creates a receiver with the given policy hooks and default
    /// configuration: listen on every interface on port 25, announce the OS
    /// hostname, no I/O deadlines, pregreet probe disabled.
    pub const fn new(hooks: H) -> Self {
        Self {
            addr: String::new(),
            hostname: String::new(),
            read_timeout: None,
            write_timeout: None,
            pregreet_delay: None,
            hooks,
        }
    }

    /// Sets the TCP listen address. Empty means every interface on port 25.
    pub fn with_addr(&mut self, addr: impl Into<String>) -> &mut Self {
        self.addr = addr.into();
        self
    }

    /// Sets the hostname announced in the greeting, the `HELO`/`EHLO`
    /// replies, and the `Received:` header. Empty means the OS hostname.
    pub fn with_hostname(&mut self, hostname: impl Into<String>) -> &mut Self {
        self.hostname = hostname.into();
        self
    }

    /// Sets the deadline applied to each read from a client.
    ///
    /// This is a per-read deadline, not an idle bound: inside the command
    /// loop an elapsed read deadline is simply reapplied, so an idle but
    /// live connection is never dropped by the receiver. Evicting idle
    /// clients is the caller's policy, enforced by cancelling the server.
    /// Inside a `DATA` body, an elapsed deadline aborts the session.
    pub fn with_read_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Sets the deadline applied to each reply write.
    pub fn with_write_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.write_timeout = Some(timeout);
        self
    }

    /// Enables the pre-greeting probe and sets how long it waits.
    ///
    /// Clients that transmit before the server finishes its greeting banner
    /// violate RFC 5321, and real mail software essentially never does; spam
    /// cannon software very often does. With a delay configured, each
    /// session sends a `220-Wait` continuation line, waits, and records on
    /// its [`Client`] whether anything arrived early. The probe rejects
    /// nothing by itself; hooks read [`Client::pregreeted`] and decide.
    pub fn with_pregreet_delay(&mut self, delay: Duration) -> &mut Self {
        self.pregreet_delay = Some(delay);
        self
    }

    /// The hostname to announce: the configured one, the OS hostname, or
    /// empty if neither is available.
    pub(crate) fn hostname(&self) -> String {
        if !self.hostname.is_empty() {
            return self.hostname.clone();
        }

        hostname::get().map_or_else(
            |_| String::new(),
            |hostname| hostname.to_string_lossy().into_owned(),
        )
    }

    /// Opens a TCP listener on the configured address without serving on it.
    ///
    /// Binding separately is useful for sandboxing and for tests: bind
    /// `127.0.0.1:0`, read the assigned port off the listener, then pass it
    /// to [`Server::serve`].
    ///
    /// # Errors
    ///
    /// [`std::io::Error`] from [`TcpListener::bind`].
    pub async fn listen(&self) -> Result<TcpListener> {
        let addr = if self.addr.is_empty() {
            DEFAULT_ADDR
        } else {
            &self.addr
        };

        TcpListener::bind(addr).await
    }

    /// Handles incoming SMTP connections on the provided listener.
    ///
    /// Owns the listener for the duration of the call. Returns when `cancel`
    /// fires or a fatal accept error occurs, and in both cases only after
    /// every session it spawned has returned. No new session starts once `cancel`
    /// has fired; running sessions observe the signal between commands and
    /// answer `421 Server shutting down`, which deliberately lets an
    /// in-progress `DATA` body complete or time out on its own.
    ///
    /// # Errors
    ///
    /// The fatal accept error, if one ended the loop. Graceful shutdown
    /// returns `Ok`.
    pub async fn serve(self, cancel: CancellationToken, listener: TcpListener) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!("listening on {addr}");
        }

        let srv = Arc::new(self);
        let mut sessions: JoinSet<()> = JoinSet::new();
        let mut fatal = None;

        let incoming = accept_stream(listener);
        pin_mut!(incoming);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                accepted = incoming.next() => match accepted {
                    Some(Ok((stream, peer))) => {
                        debug!("accepted connection from {peer}");

                        let session = connection::Session::new(Arc::clone(&srv), stream, peer);
                        let session_cancel = cancel.clone();
                        sessions.spawn(async move {
                            if let Err(err) = session.run(session_cancel).await {
                                debug!(%peer, "client error: {err}");
                            }
                        });
                    }
                    Some(Err(err)) => {
                        fatal = Some(err);
                        break;
                    }
                    // The stream is infinite until a fatal error.
                    None => break,
                },
                // Reap finished sessions as they end, so the set does not
                // accumulate results for the lifetime of the server.
                Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(err) = finished {
                        warn!("session task failed: {err}");
                    }
                }
            }
        }

        // Dispatching has stopped; wait for in-flight sessions to drain.
        while let Some(finished) = sessions.join_next().await {
            if let Err(err) = finished {
                warn!("session task failed: {err}");
            }
        }

        fatal.map_or(Ok(()), Err)
    }

    /// Listens on the configured address and then calls [`Server::serve`] to
    /// handle connections until `cancel` fires.
    ///
    /// # Errors
    ///
    /// - [`std::io::Error`] from [`Server::listen`] if binding fails.
    /// - The fatal accept error, if one ended [`Server::serve`].
    pub async fn listen_and_serve(self, cancel: CancellationToken) -> Result<()> {
        let listener = self.listen().await?;

        self.serve(cancel, listener).await
    }
}

/// Accepts connections forever, yielding each accepted socket.
///
/// This stream is the serialization point between accepting and dispatching:
/// nothing is accepted unless the serve loop is asking, so cancellation
/// preempts dispatch simply by no longer polling.
///
/// Transient accept failures are logged and retried. Any other accept error
/// is yielded and ends the stream; [`Server::serve`] treats it as fatal.
fn accept_stream(listener: TcpListener) -> impl Stream<Item = Result<(TcpStream, SocketAddr)>> {
    try_stream! {
        loop {
            let accepted = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) if is_transient(&err) => {
                    warn!("accept error: {err}");
                    continue;
                }
                Err(err) => {
                    error!("fatal accept error: {err}");
                    Err(err)?
                }
            };

            yield accepted;
        }
    }
}

/// Whether an accept error concerns only the connection being accepted
/// (retry) rather than the listener itself (fatal).
///
/// These are the kinds the runtime reports when a queued connection died
/// before it could be handed over; exhaustion or teardown of the listener
/// surfaces as anything else.
fn is_transient(error: &std::io::Error) -> bool {
    use std::io::ErrorKind;

    matches!(
        error.kind(),
        ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
            | ErrorKind::TimedOut
    )
}

/// Read a line out of `reader`.
///
/// Returns a [`std::future::Future`], use with `.await`. The caller must
/// have [`tokio::io::AsyncBufReadExt`] in scope.
///
/// # Errors
///
/// - Any errors that could come out of the supplied reader's `read_line` function.
/// - If `read_line` reads zero bytes, [`std::io::ErrorKind::ConnectionAborted`] is returned.
#[macro_export]
macro_rules! read_line {
    ($reader:expr) => {
        async {
            let mut read_line_macro_buffer = String::new();
            match $reader.read_line(&mut read_line_macro_buffer).await {
                Ok(read_bytes) => {
                    if read_bytes == 0 {
                        Err(::std::io::ErrorKind::ConnectionAborted.into())
                    } else {
                        Ok(read_line_macro_buffer)
                    }
                }
                Err(e) => Err(e),
            }
        }
    };
}

/// Write a string literal into `writer` as an [`crate::str::SmtpString`]. Appends a line ending.
///
/// # Errors
///
/// - [`std::io::ErrorKind::InvalidInput`] if passed invalid ASCII.
/// - Any errors that could come out of the supplied writer's `write_all` function.
#[macro_export]
macro_rules! write_line {
    ($writer:expr, $str:expr) => {{
        match $crate::str::SmtpString::new(concat!($str, "\r\n")) {
            Ok(s) => $writer.write_all(s.as_bytes()).await,
            Err(e) => Err(::std::io::Error::new(::std::io::ErrorKind::InvalidInput, e)),
        }
    }};
}

/// Write a format statement into `writer` as an [`crate::str::SmtpString`]. Appends a line ending.
///
/// All but the first parameter are passed directly into [`format`].
///
/// # Errors
///
/// - [`std::io::ErrorKind::InvalidInput`] if passed invalid ASCII.
/// - Any errors that could come out of the supplied writer's `write_all` function.
#[macro_export]
macro_rules! write_fmt_line {
    ($writer:expr, $( $fmt:expr ),+) => {{
        match $crate::str::SmtpString::new(&format!("{}\r\n", format!( $($fmt),+ ))) {
            Ok(s) => $writer.write_all(s.as_bytes()).await,
            Err(e) => Err(::std::io::Error::new(::std::io::ErrorKind::InvalidInput, e)),
        }
    }};
}
