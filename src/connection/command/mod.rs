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

//! Parses a single line from an SMTP client.
//!
//! See [`CmdLine`].

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use crate::{envelope::MailAddress, str::CRLF};


/// Matches the `FROM:<...>` portion of a `MAIL` argument. The address may be
/// empty: `<>` is the null reverse-path ([RFC 5321 section
/// 4.5.5](https://www.rfc-editor.org/rfc/rfc5321.html#section-4.5.5)).
static MAIL_FROM: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)from:<(.*)>").unwrap());

/// Matches the `TO:<...>` portion of a `RCPT` argument. Unlike a
/// reverse-path, a forward-path must name someone.
static RCPT_TO: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)to:<(.+)>").unwrap());

/// One line received from the client, kept as raw text including whatever
/// line terminator it arrived with.
///
/// [`CmdLine::check_valid`] enforces the framing rules; the accessors make
/// no assumptions beyond them, so they are safe to call on a line that
/// failed the check (the session logs such lines).
#[derive(PartialEq, Eq, Debug, Clone)]
pub(crate) struct CmdLine(String);

impl CmdLine {
    pub const fn new(line: String) -> Self {
        Self(line)
    }

    /// Enforce the framing rules of [RFC 5321 section
    /// 2.3.8](https://www.rfc-editor.org/rfc/rfc5321.html#section-2.3.8)
    /// (`CRLF` termination) and section 4.1.1 (`RSET`, `DATA`, and `QUIT`
    /// take no argument).
    ///
    /// # Errors
    ///
    /// A [`CmdLineError`] whose `Display` form is the text of the `500`
    /// reply the session sends back.
    pub fn check_valid(&self) -> Result<(), CmdLineError> {
        if !self.0.ends_with(CRLF) {
            return Err(CmdLineError::MissingCrlf);
        }

        match self.verb().as_str() {
            "RSET" | "DATA" | "QUIT" if !self.arg().is_empty() => {
                Err(CmdLineError::UnexpectedArgument)
            }
            _ => Ok(()),
        }
    }

    /// The upper-cased verb: everything before the first space, or the whole
    /// line minus its terminator if there is no space.
    pub fn verb(&self) -> String {
        self.0.find(' ').map_or_else(
            || self.0.trim_end_matches(CRLF).to_uppercase(),
            |index| self.0[..index].to_uppercase(),
        )
    }

    /// The argument: everything after the first space, with the terminator
    /// and any other trailing whitespace removed. Empty if the line has no
    /// space.
    ///
    /// Case is preserved: the mailbox-local part of an address is the only
    /// case-sensitive element of an SMTP command.
    pub fn arg(&self) -> &str {
        self.0
            .find(' ')
            .map_or("", |index| self.0[index + 1..].trim_end())
    }

    /// The sender address of a `MAIL` command, or `None` if the argument
    /// does not contain a well-formed `FROM:<...>`. A `<` without a closing
    /// `>` does not match, and neither does whitespace between the colon and
    /// the bracket.
    pub fn mail_from_address(&self) -> Option<MailAddress> {
        MAIL_FROM
            .captures(self.arg())
            .map(|captures| MailAddress::new(&captures[1]))
    }

    /// The recipient address of a `RCPT` command, or `None` if the argument
    /// does not contain a well-formed, non-empty `TO:<...>`.
    pub fn rcpt_to_address(&self) -> Option<MailAddress> {
        RCPT_TO
            .captures(self.arg())
            .map(|captures| MailAddress::new(&captures[1]))
    }

    /// The raw line, for logging.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Possible rejections from [`CmdLine::check_valid`].
#[derive(PartialEq, Eq, Debug, Copy, Clone, Error)]
pub(crate) enum CmdLineError {
    /// The line was not terminated by `CRLF`.
    #[error(r"line doesn't end in \r\n")]
    MissingCrlf,
    /// The verb takes no argument, but one was supplied.
    #[error("unexpected argument")]
    UnexpectedArgument,
}
