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

use std::{error::Error, net::SocketAddr, time::Duration};

use lettre::{
    message::{Mailbox, Message},
    SmtpTransport, Transport,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::mpsc,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    read_line, write_fmt_line, write_line, AcceptAll, Client, Envelope, HookError, Hooks,
    MailAddress, Server,
};


type Result = std::result::Result<(), Box<dyn Error>>;

const HOSTNAME: &str = "server.invalid";

/// Binds an ephemeral local port and serves `server` on it in a background
/// task.
async fn spawn_server<H: Hooks>(
    mut server: Server<H>,
) -> std::io::Result<(SocketAddr, CancellationToken, JoinHandle<std::io::Result<()>>)> {
    server.with_addr("127.0.0.1:0").with_hostname(HOSTNAME);

    let listener = server.listen().await?;
    let addr = listener.local_addr()?;
    let cancel = CancellationToken::new();
    let serving = tokio::spawn(server.serve(cancel.clone(), listener));

    Ok((addr, cancel, serving))
}

/// Connects to `addr` and consumes the greeting.
async fn connect(addr: SocketAddr) -> std::io::Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
    let stream = TcpStream::connect(addr).await?;
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let greeting = read_line!(reader).await?;
    assert!(is_valid_reply::server_greeting(&greeting));
    assert_eq!(greeting, "220 server.invalid ESMTP\r\n");

    Ok((reader, write_half))
}

/// Sends one command line and returns the single reply line.
async fn roundtrip(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    command: &str,
) -> std::io::Result<String> {
    write_fmt_line!(writer, "{command}")?;
    read_line!(reader).await
}

/// Hands every delivered envelope to the test over a channel.
struct Capture {
    delivered: mpsc::UnboundedSender<Envelope>,
}

impl Capture {
    fn new() -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (delivered, receiver) = mpsc::unbounded_channel();

        (Self { delivered }, receiver)
    }
}

#[async_trait::async_trait]
impl Hooks for Capture {
    async fn deliver(&self, envelope: Envelope) -> std::result::Result<(), HookError> {
        // Errors only when the test has dropped its receiver.
        let _ = self.delivered.send(envelope);

        Ok(())
    }
}

/// Rejects every recipient with an opaque error, as a policy that has no
/// opinion on the wire reply would.
struct RejectRecipients;

#[async_trait::async_trait]
impl Hooks for RejectRecipients {
    async fn on_rcpt_to(
        &self,
        _client: &Client,
        _rcpt: &MailAddress,
    ) -> std::result::Result<(), HookError> {
        Err(HookError::other("don't want mail for this address"))
    }
}

/// Rejects every sender with a preformatted SMTP reply.
struct Blocklist;

#[async_trait::async_trait]
impl Hooks for Blocklist {
    async fn on_mail_from(
        &self,
        _client: &Client,
        _from: &MailAddress,
    ) -> std::result::Result<(), HookError> {
        Err(HookError::reply("550 5.7.1 IP address blacklisted"))
    }
}

#[tokio::test]
async fn test_helo() -> Result {
    let (addr, cancel, serving) = spawn_server(Server::new(AcceptAll)).await?;
    let (mut reader, mut writer) = connect(addr).await?;

    let reply = roundtrip(&mut reader, &mut writer, "HELO client.invalid").await?;
    assert!(is_valid_reply::helo(&reply));
    assert_eq!(reply, "250 server.invalid\r\n");

    write_line!(writer, "QUIT")?;
    assert!(is_valid_reply::quit(&read_line!(reader).await?));

    cancel.cancel();
    serving.await??;

    Ok(())
}

#[tokio::test]
async fn test_ehlo_advertisement() -> Result {
    let (addr, cancel, serving) = spawn_server(Server::new(AcceptAll)).await?;
    let (mut reader, mut writer) = connect(addr).await?;

    write_line!(writer, "EHLO client.invalid")?;
    assert_eq!(read_line!(reader).await?, "250-server.invalid\r\n");
    assert_eq!(read_line!(reader).await?, "250-PIPELINING\r\n");
    assert_eq!(read_line!(reader).await?, "250-SIZE 10240000\r\n");
    assert_eq!(read_line!(reader).await?, "250-ENHANCEDSTATUSCODES\r\n");
    assert_eq!(read_line!(reader).await?, "250-8BITMIME\r\n");
    assert_eq!(read_line!(reader).await?, "250 DSN\r\n");

    write_line!(writer, "QUIT")?;
    assert!(is_valid_reply::quit(&read_line!(reader).await?));

    cancel.cancel();
    serving.await??;

    Ok(())
}

#[tokio::test]
async fn test_reject_recipient() -> Result {
    let (addr, cancel, serving) = spawn_server(Server::new(RejectRecipients)).await?;
    let (mut reader, mut writer) = connect(addr).await?;

    roundtrip(&mut reader, &mut writer, "HELO client.invalid").await?;
    assert_eq!(
        roundtrip(&mut reader, &mut writer, "MAIL FROM:<bob@client.invalid>").await?,
        "250 2.1.0 Ok\r\n"
    );

    // An opaque rejection gets the default permanent reply.
    assert_eq!(
        roundtrip(&mut reader, &mut writer, "RCPT TO:<anyone@server.invalid>").await?,
        "550 5.0.0 unacceptable recipient\r\n"
    );

    // Nothing was appended to the envelope, so the body phase stays
    // unreachable.
    assert_eq!(
        roundtrip(&mut reader, &mut writer, "DATA").await?,
        "503 5.5.1 Error: need RCPT command\r\n"
    );

    write_line!(writer, "QUIT")?;
    cancel.cancel();
    serving.await??;

    Ok(())
}

#[tokio::test]
async fn test_hook_reply_sent_verbatim() -> Result {
    let (addr, cancel, serving) = spawn_server(Server::new(Blocklist)).await?;
    let (mut reader, mut writer) = connect(addr).await?;

    roundtrip(&mut reader, &mut writer, "HELO client.invalid").await?;
    assert_eq!(
        roundtrip(&mut reader, &mut writer, "MAIL FROM:<bob@client.invalid>").await?,
        "550 5.7.1 IP address blacklisted\r\n"
    );

    write_line!(writer, "QUIT")?;
    cancel.cancel();
    serving.await??;

    Ok(())
}

#[tokio::test]
async fn test_invalid_mail_from_space() -> Result {
    let (addr, cancel, serving) = spawn_server(Server::new(AcceptAll)).await?;
    let (mut reader, mut writer) = connect(addr).await?;

    roundtrip(&mut reader, &mut writer, "HELO client.invalid").await?;
    assert_eq!(
        roundtrip(
            &mut reader,
            &mut writer,
            "MAIL FROM: <superfluous.space@example.net"
        )
        .await?,
        "501 5.1.7 Bad sender address syntax\r\n"
    );

    // A syntax error does not end the session.
    assert_eq!(
        roundtrip(&mut reader, &mut writer, "MAIL FROM:<bob@client.invalid>").await?,
        "250 2.1.0 Ok\r\n"
    );

    write_line!(writer, "QUIT")?;
    cancel.cancel();
    serving.await??;

    Ok(())
}

#[tokio::test]
async fn test_command_sequencing() -> Result {
    let (addr, cancel, serving) = spawn_server(Server::new(AcceptAll)).await?;
    let (mut reader, mut writer) = connect(addr).await?;

    assert_eq!(
        roundtrip(&mut reader, &mut writer, "FOO bar").await?,
        "502 5.5.2 Error: command not recognized\r\n"
    );
    assert_eq!(
        roundtrip(&mut reader, &mut writer, "RCPT TO:<joe@server.invalid>").await?,
        "503 5.5.1 Error: need MAIL command\r\n"
    );
    assert_eq!(
        roundtrip(&mut reader, &mut writer, "DATA").await?,
        "503 5.5.1 Error: need RCPT command\r\n"
    );
    assert_eq!(
        roundtrip(&mut reader, &mut writer, "RSET everything").await?,
        "500 unexpected argument\r\n"
    );
    assert_eq!(
        roundtrip(&mut reader, &mut writer, "NOOP").await?,
        "250 2.0.0 OK\r\n"
    );

    write_line!(writer, "QUIT")?;
    cancel.cancel();
    serving.await??;

    Ok(())
}

#[tokio::test]
async fn test_nested_mail() -> Result {
    let (addr, cancel, serving) = spawn_server(Server::new(AcceptAll)).await?;
    let (mut reader, mut writer) = connect(addr).await?;

    roundtrip(&mut reader, &mut writer, "HELO client.invalid").await?;
    roundtrip(&mut reader, &mut writer, "MAIL FROM:<bob@client.invalid>").await?;
    assert_eq!(
        roundtrip(&mut reader, &mut writer, "MAIL FROM:<eve@client.invalid>").await?,
        "503 5.5.1 Error: nested MAIL command\r\n"
    );

    // RSET discards the open transaction and MAIL is legal again.
    assert_eq!(
        roundtrip(&mut reader, &mut writer, "RSET").await?,
        "250 2.0.0 OK\r\n"
    );
    assert_eq!(
        roundtrip(&mut reader, &mut writer, "MAIL FROM:<eve@client.invalid>").await?,
        "250 2.1.0 Ok\r\n"
    );

    write_line!(writer, "QUIT")?;
    cancel.cancel();
    serving.await??;

    Ok(())
}

#[tokio::test]
async fn test_delivery() -> Result {
    let (hooks, mut delivered) = Capture::new();
    let (addr, cancel, serving) = spawn_server(Server::new(hooks)).await?;
    let (mut reader, mut writer) = connect(addr).await?;

    roundtrip(&mut reader, &mut writer, "EHLO client.invalid").await?;
    for _ in 0..5 {
        // The rest of the capability advertisement.
        read_line!(reader).await?;
    }

    roundtrip(&mut reader, &mut writer, "MAIL FROM:<bob@client.invalid>").await?;
    roundtrip(&mut reader, &mut writer, "RCPT TO:<joe@server.invalid>").await?;
    assert_eq!(
        roundtrip(&mut reader, &mut writer, "RCPT TO:<ann@server.invalid>").await?,
        "250 2.1.0 Ok\r\n"
    );
    assert_eq!(
        roundtrip(&mut reader, &mut writer, "DATA").await?,
        "354 Go ahead\r\n"
    );

    writer
        .write_all(b"Subject: greetings\r\n\r\nThe e-mail goes here.\r\n.\r\n")
        .await?;
    assert_eq!(read_line!(reader).await?, "250 2.0.0 Ok: queued\r\n");

    write_line!(writer, "QUIT")?;
    cancel.cancel();
    serving.await??;

    let envelope = delivered.recv().await.ok_or("no envelope delivered")?;
    assert_eq!(envelope.sender().email(), "bob@client.invalid");
    assert_eq!(
        envelope
            .recipients()
            .iter()
            .map(MailAddress::email)
            .collect::<Vec<_>>(),
        ["joe@server.invalid", "ann@server.invalid"]
    );

    let data = String::from_utf8(envelope.into_data())?;
    assert!(data.starts_with("Received: from client.invalid ["));
    assert!(data.contains("\tby server.invalid ("));
    assert!(data.contains(") with ESMTP\r\n"));
    assert!(data.contains("\tfor <joe@server.invalid>; "));
    assert!(data.ends_with("Subject: greetings\r\n\r\nThe e-mail goes here.\r\n"));

    Ok(())
}

#[tokio::test]
async fn test_rset_discards_transaction() -> Result {
    let (hooks, mut delivered) = Capture::new();
    let (addr, cancel, serving) = spawn_server(Server::new(hooks)).await?;
    let (mut reader, mut writer) = connect(addr).await?;

    roundtrip(&mut reader, &mut writer, "HELO client.invalid").await?;
    roundtrip(&mut reader, &mut writer, "MAIL FROM:<first@client.invalid>").await?;
    roundtrip(&mut reader, &mut writer, "RCPT TO:<joe@server.invalid>").await?;
    assert_eq!(
        roundtrip(&mut reader, &mut writer, "RSET").await?,
        "250 2.0.0 OK\r\n"
    );

    roundtrip(&mut reader, &mut writer, "MAIL FROM:<second@client.invalid>").await?;
    roundtrip(&mut reader, &mut writer, "RCPT TO:<joe@server.invalid>").await?;
    roundtrip(&mut reader, &mut writer, "DATA").await?;
    writer.write_all(b"After the reset.\r\n.\r\n").await?;
    assert_eq!(read_line!(reader).await?, "250 2.0.0 Ok: queued\r\n");

    write_line!(writer, "QUIT")?;
    cancel.cancel();
    serving.await??;

    // Only the post-reset transaction was delivered.
    let envelope = delivered.recv().await.ok_or("no envelope delivered")?;
    assert_eq!(envelope.sender().email(), "second@client.invalid");
    assert!(delivered.recv().await.is_none());

    Ok(())
}

#[tokio::test]
async fn test_dot_transparency() -> Result {
    let (hooks, mut delivered) = Capture::new();
    let (addr, cancel, serving) = spawn_server(Server::new(hooks)).await?;
    let (mut reader, mut writer) = connect(addr).await?;

    roundtrip(&mut reader, &mut writer, "HELO client.invalid").await?;
    roundtrip(&mut reader, &mut writer, "MAIL FROM:<bob@client.invalid>").await?;
    roundtrip(&mut reader, &mut writer, "RCPT TO:<joe@server.invalid>").await?;
    roundtrip(&mut reader, &mut writer, "DATA").await?;

    writer.write_all(b".Leading dot\r\nOK\r\n.\r\n").await?;
    assert_eq!(read_line!(reader).await?, "250 2.0.0 Ok: queued\r\n");

    write_line!(writer, "QUIT")?;
    cancel.cancel();
    serving.await??;

    let envelope = delivered.recv().await.ok_or("no envelope delivered")?;
    let data = String::from_utf8(envelope.into_data())?;

    // The stuffed dot is stripped and the terminator is gone.
    assert!(data.ends_with("Leading dot\r\nOK\r\n"));
    assert!(!data.contains(".Leading"));
    assert!(!data.contains("\r\n.\r\n"));

    Ok(())
}

#[tokio::test]
async fn test_pregreet_detected() -> Result {
    let (hooks, mut delivered) = Capture::new();
    let mut server = Server::new(hooks);
    server.with_pregreet_delay(Duration::from_secs(5));
    let (addr, cancel, serving) = spawn_server(server).await?;

    // Blast the whole conversation without waiting for a single reply.
    let mut stream = TcpStream::connect(addr).await?;
    stream
        .write_all(
            b"HELO client.invalid\r\n\
              MAIL FROM:<bob@client.invalid>\r\n\
              RCPT TO:<joe@server.invalid>\r\n\
              DATA\r\n\
              The e-mail goes here.\r\n\
              .\r\n\
              QUIT\r\n",
        )
        .await?;

    let (read_half, _write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    loop {
        let line = read_line!(reader).await?;
        assert!(is_valid_reply::smtp_line(&line));
        if line == "221 2.0.0 Bye\r\n" {
            break;
        }
    }

    let envelope = delivered.recv().await.ok_or("no envelope delivered")?;
    assert!(envelope.client().pregreeted());
    assert_eq!(envelope.client().helo_host(), "client.invalid");
    assert_eq!(envelope.sender().email(), "bob@client.invalid");

    cancel.cancel();
    serving.await??;

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_no_pregreet() -> Result {
    let (hooks, mut delivered) = Capture::new();
    let mut server = Server::new(hooks);
    server.with_pregreet_delay(Duration::from_secs(2));
    let (addr, cancel, serving) = spawn_server(server).await?;

    // A well-behaved client waits out the probe without a false positive.
    tokio::task::spawn_blocking(move || {
        let message = Message::builder()
            .from("Bob <bob@client.invalid>".parse::<Mailbox>()?)
            .to("Joe <joe@server.invalid>".parse::<Mailbox>()?)
            .subject("patience")
            .body("Mail goes here\r\n".to_owned())?;

        let mailer = SmtpTransport::builder_dangerous("127.0.0.1")
            .port(addr.port())
            .build();
        mailer.send(&message)?;

        Ok::<_, Box<dyn Error + Send + Sync>>(())
    })
    .await?
    .map_err(|e| Box::<dyn Error>::from(e.to_string()))?;

    let envelope = delivered.recv().await.ok_or("no envelope delivered")?;
    assert!(!envelope.client().pregreeted());
    assert_eq!(envelope.sender().email(), "bob@client.invalid");
    assert!(String::from_utf8(envelope.into_data())?.contains("patience"));

    cancel.cancel();
    serving.await??;

    Ok(())
}

#[tokio::test]
async fn test_shutdown_answers_421() -> Result {
    let mut server = Server::new(AcceptAll);
    server.with_read_timeout(Duration::from_millis(100));
    let (addr, cancel, serving) = spawn_server(server).await?;
    let (mut reader, _writer) = connect(addr).await?;

    cancel.cancel();

    // The idle read deadline elapses, the loop rechecks the signal, and the
    // session says goodbye exactly once before closing.
    assert_eq!(read_line!(reader).await?, "421 Server shutting down\r\n");
    assert!(read_line!(reader).await.is_err());

    serving.await??;

    Ok(())
}
