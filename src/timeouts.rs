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

//! Fixed timing constants of the receiver.
//!
//! The *configurable* deadlines (how long to wait for a command, how long a
//! reply write may take) live on [`crate::Server`] and default to none, per
//! the generous minimums of [RFC 5321 section
//! 4.5.3.2](https://www.rfc-editor.org/rfc/rfc5321.html#section-4.5.3.2).
//! What lives here is the timing the receiver does not expose.

/// How long the pre-greeting probe waits on the socket per poll.
///
/// The probe races a wall-clock delay against whatever the client transmits
/// early, so it reads with short deadlines and rechecks the clock between
/// polls. 100 ms keeps the overshoot past the configured delay small without
/// busy-spinning on the socket.
pub const PREGREET_POLL: std::time::Duration = std::time::Duration::from_millis(100);
