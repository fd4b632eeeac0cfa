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

//! Drives an accepted TCP connection through the SMTP dialogue.
//!
//! See [`Session`].

mod command;

use std::{
    io::{Error, ErrorKind, Result},
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    time::{timeout, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use self::command::CmdLine;
use crate::{
    envelope::{Client, Envelope, HeloKind},
    hook::{HookError, Hooks},
    str::{SmtpString, CRLF},
    timeouts::PREGREET_POLL,
    Server,
};

/// The capabilities advertised in response to `EHLO`, already formatted as
/// the continuation lines of the `250` reply.
const EXTENSIONS: [&str; 5] = [
    "250-PIPELINING",
    "250-SIZE 10240000",
    "250-ENHANCEDSTATUSCODES",
    "250-8BITMIME",
    "250 DSN",
];

/// One SMTP session over one accepted connection.
///
/// The session exclusively owns its socket halves, its [`Client`] record,
/// and the envelope under construction; nothing here is shared with other
/// sessions, and the socket closes when the session is dropped.
///
/// Replies are written strictly in step with commands: reply *N* is flushed
/// before command *N + 1* is read. Pipelining clients are served correctly
/// because their queued commands simply wait in the read buffer.
pub(crate) struct Session<H: Hooks> {
    srv: Arc<Server<H>>,
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
    client: Client,
    /// The transaction being assembled, if a `MAIL FROM` has been accepted.
    envelope: Option<Envelope>,
}

impl<H: Hooks> Session<H> {
    pub fn new(srv: Arc<Server<H>>, stream: TcpStream, peer: SocketAddr) -> Self {
        let (read_half, write_half) = stream.into_split();

        Self {
            srv,
            reader: BufReader::new(read_half),
            writer: BufWriter::new(write_half),
            client: Client::new(peer),
            envelope: None,
        }
    }

    /// Runs the session to completion: the new-connection hook, the pregreet
    /// probe, the greeting, and then the command loop until the client
    /// quits, the transport fails, or `cancel` fires.
    ///
    /// Protocol and policy failures are answered on the wire and do not
    /// surface here.
    ///
    /// # Errors
    ///
    /// Transport failures: read or write errors other than an idle read
    /// timeout.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        if let Err(err) = self.srv.hooks.on_new_connection(&self.client).await {
            debug!(peer = %self.client.addr(), "connection rejected: {err}");
            return self.send_reply_or(&err, "554 connection rejected").await;
        }

        let mut preline = None;
        if let Some(delay) = self.srv.pregreet_delay {
            preline = self.pregreet_check(delay).await?;
            if preline.is_some() {
                self.client.pregreeted = true;
            }
        }

        self.send_line(&format!("220 {} ESMTP", self.srv.hostname()))
            .await?;

        let mut line_buf = Vec::new();
        loop {
            if cancel.is_cancelled() {
                return self.send_line("421 Server shutting down").await;
            }

            let line = if let Some(pre) = preline.take() {
                CmdLine::new(pre)
            } else {
                let read = self.reader.read_until(b'\n', &mut line_buf);
                let read_bytes = match self.srv.read_timeout {
                    // An idle timeout is not fatal: recheck the shutdown
                    // signal and wait again. Bytes read before the deadline
                    // elapsed stay in `line_buf` for the next attempt.
                    Some(deadline) => match timeout(deadline, read).await {
                        Err(_elapsed) => continue,
                        Ok(result) => result?,
                    },
                    None => read.await?,
                };
                if read_bytes == 0 {
                    debug!(peer = %self.client.addr(), "client disconnected");
                    return Ok(());
                }

                let line = String::from_utf8_lossy(&line_buf).into_owned();
                line_buf.clear();
                CmdLine::new(line)
            };

            if let Err(err) = line.check_valid() {
                self.send_line(&format!("500 {err}")).await?;
                continue;
            }

            match line.verb().as_str() {
                "HELO" => self.handle_helo(line.arg().to_owned()).await?,
                "EHLO" => self.handle_ehlo(line.arg().to_owned()).await?,
                "QUIT" => {
                    return self.send_line("221 2.0.0 Bye").await;
                }
                "RSET" => {
                    self.envelope = None;
                    self.send_line("250 2.0.0 OK").await?;
                }
                "NOOP" => self.send_line("250 2.0.0 OK").await?,
                "MAIL" => self.handle_mail(&line).await?,
                "RCPT" => self.handle_rcpt(&line).await?,
                "DATA" => self.handle_data().await?,
                verb => {
                    debug!(peer = %self.client.addr(), line = ?line.as_str(), verb, "unrecognized command");
                    self.send_line("502 5.5.2 Error: command not recognized")
                        .await?;
                }
            }
        }
    }

    /// Watches for the client speaking before the final `220` greeting.
    ///
    /// Sends the partial banner `220-Wait`, then polls the socket with
    /// [`PREGREET_POLL`]-long deadlines for at most `delay`, accumulating
    /// whatever arrives. Stops early once a complete line has been
    /// collected, or on a hard read error (nothing further can arrive after
    /// EOF). Returns the collected bytes, if any, so the command loop can
    /// consume them as the client's first command.
    ///
    /// Compliant clients see one extra `220-` continuation line and a pause
    /// before the real greeting, which is a legal multi-line reply.
    async fn pregreet_check(&mut self, delay: Duration) -> Result<Option<String>> {
        self.send_line("220-Wait").await?;

        let deadline = Instant::now() + delay;
        let mut collected = Vec::new();
        while Instant::now() < deadline {
            match timeout(PREGREET_POLL, self.reader.read_u8()).await {
                // Nothing yet; recheck the clock and poll again.
                Err(_elapsed) => continue,
                Ok(Err(_)) => break,
                Ok(Ok(byte)) => {
                    collected.push(byte);
                    if byte == b'\n' {
                        break;
                    }
                }
            }
        }

        if collected.is_empty() {
            return Ok(None);
        }
        let line = String::from_utf8_lossy(&collected).into_owned();
        debug!(peer = %self.client.addr(), line = ?line, "client pregreeted");
        Ok(Some(line))
    }

    async fn handle_helo(&mut self, host: String) -> Result<()> {
        self.client.helo_kind = Some(HeloKind::Helo);
        self.client.helo_host = host;

        self.send_line(&format!("250 {}", self.srv.hostname())).await
    }

    async fn handle_ehlo(&mut self, host: String) -> Result<()> {
        self.client.helo_kind = Some(HeloKind::Ehlo);
        self.client.helo_host = host;

        let mut reply = format!("250-{}{CRLF}", self.srv.hostname());
        for extension in EXTENSIONS {
            reply.push_str(extension);
            reply.push_str(CRLF);
        }
        self.send_raw(&reply).await
    }

    async fn handle_mail(&mut self, line: &CmdLine) -> Result<()> {
        let Some(from) = line.mail_from_address() else {
            debug!(peer = %self.client.addr(), arg = ?line.arg(), "invalid MAIL argument");
            return self.send_line("501 5.1.7 Bad sender address syntax").await;
        };

        if self.envelope.is_some() {
            return self.send_line("503 5.5.1 Error: nested MAIL command").await;
        }
        debug!(peer = %self.client.addr(), "mail from: {from}");

        if let Err(err) = self.srv.hooks.on_mail_from(&self.client, &from).await {
            debug!(peer = %self.client.addr(), "rejected sender {from}: {err}");
            return self
                .send_reply_or(&err, "550 5.0.0 unacceptable sender")
                .await;
        }

        self.envelope = Some(Envelope::new(self.client.clone(), from));
        self.send_line("250 2.1.0 Ok").await
    }

    async fn handle_rcpt(&mut self, line: &CmdLine) -> Result<()> {
        if self.envelope.is_none() {
            return self.send_line("503 5.5.1 Error: need MAIL command").await;
        }

        let Some(recipient) = line.rcpt_to_address() else {
            debug!(peer = %self.client.addr(), arg = ?line.arg(), "invalid RCPT argument");
            return self.send_line("501 5.1.7 Bad sender address syntax").await;
        };

        if let Err(err) = self.srv.hooks.on_rcpt_to(&self.client, &recipient).await {
            debug!(peer = %self.client.addr(), "rejected recipient {recipient}: {err}");
            return self
                .send_reply_or(&err, "550 5.0.0 unacceptable recipient")
                .await;
        }

        if let Some(envelope) = self.envelope.as_mut() {
            envelope.add_recipient(recipient);
        }
        self.send_line("250 2.1.0 Ok").await
    }

    /// Reads the message body, hands the finished envelope to the delivery
    /// hook, and reports the verdict to the client.
    ///
    /// Requires at least one accepted recipient: an envelope with none would
    /// have no address for the `Received:` header's `for` clause, so the
    /// state machine refuses to enter the body phase without one.
    async fn handle_data(&mut self) -> Result<()> {
        if !self
            .envelope
            .as_ref()
            .is_some_and(|envelope| !envelope.recipients().is_empty())
        {
            return self.send_line("503 5.5.1 Error: need RCPT command").await;
        }
        self.send_line("354 Go ahead").await?;

        let mut body = Vec::new();
        let mut line_buf = Vec::new();
        loop {
            line_buf.clear();
            let read = self.reader.read_until(b'\n', &mut line_buf);
            let read_bytes = match self.srv.read_timeout {
                // Unlike the command loop, a stalled body is fatal: the
                // transaction cannot be left half-read.
                Some(deadline) => timeout(deadline, read)
                    .await
                    .map_err(|_| Error::new(ErrorKind::TimedOut, "message body stalled"))??,
                None => read.await?,
            };
            if read_bytes == 0 {
                return Err(ErrorKind::UnexpectedEof.into());
            }

            if line_buf == b".\r\n" {
                break;
            }
            // Transparent-dot unescaping per RFC 5321 section 4.5.2.
            let line = if line_buf.starts_with(b".") {
                &line_buf[1..]
            } else {
                &line_buf[..]
            };
            body.extend_from_slice(line);
        }

        // Checked non-empty at the top of the function.
        let Some(mut envelope) = self.envelope.take() else {
            return Ok(());
        };
        envelope.set_data(body);
        envelope.add_received_header(&self.srv.hostname());

        match self.srv.hooks.deliver(envelope).await {
            Ok(()) => self.send_line("250 2.0.0 Ok: queued").await,
            Err(err) => {
                debug!(peer = %self.client.addr(), "delivery error: {err}");
                self.send_reply_or(&err, "450 4.3.0 Service unavailable")
                    .await
            }
        }
    }

    /// Sends one reply line, appending the terminator.
    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.send_raw(&format!("{line}{CRLF}")).await
    }

    /// Sends a hook's preformatted reply, or the given default reply for an
    /// opaque failure.
    async fn send_reply_or(&mut self, err: &HookError, default: &str) -> Result<()> {
        match err {
            HookError::Reply(reply) => self.send_line(reply).await,
            HookError::Other(_) => self.send_line(default).await,
        }
    }

    /// Writes an already CRLF-framed reply block (one line or several) and
    /// flushes it, under the configured write deadline.
    ///
    /// # Errors
    ///
    /// - [`ErrorKind::InvalidInput`] if the reply is not ASCII.
    /// - [`ErrorKind::TimedOut`] if the write deadline elapses.
    /// - I/O errors from the underlying stream.
    async fn send_raw(&mut self, reply: &str) -> Result<()> {
        let reply =
            SmtpString::new(reply).map_err(|err| Error::new(ErrorKind::InvalidInput, err))?;

        let write_timeout = self.srv.write_timeout;
        let write = async {
            self.writer.write_all(reply.as_bytes()).await?;
            self.writer.flush().await
        };
        match write_timeout {
            Some(deadline) => timeout(deadline, write)
                .await
                .map_err(|_| Error::new(ErrorKind::TimedOut, "reply write stalled"))?,
            None => write.await,
        }
    }
}
