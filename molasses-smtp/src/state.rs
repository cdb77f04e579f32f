//! Connection states.
//!
//! Transitions live in one dispatcher (`Connection::next_state`) rather
//! than per-state types, because half the protocol is fall-through: a
//! non-HELO line in `HeloIn` is retried as MAIL, then RCPT, then DATA.
//! The declaration order is load-bearing: QUIT is honoured in any state
//! before `Close`, and RSET exactly between `HeloOut` and `DataIn`.

use core::fmt::{self, Display, Formatter};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    /// Banner queued for the peer; nothing read yet.
    #[default]
    BannerSent,
    HeloIn,
    HeloOut,
    MailIn,
    MailOut,
    RcptIn,
    RcptOut,
    DataIn,
    DataOut,
    /// Consuming the message body until a lone dot or enough of it.
    Message,
    /// Assembling the per-blacklist rejection.
    Reply,
    /// Terminal; the slot is released once output drains.
    Close,
}

impl State {
    /// States in which the engine is waiting on client input.
    pub const fn awaits_input(self) -> bool {
        matches!(
            self,
            Self::HeloIn | Self::MailIn | Self::RcptIn | Self::DataIn | Self::Message
        )
    }
}

impl Display for State {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::BannerSent => "BANNER",
            Self::HeloIn | Self::HeloOut => "HELO",
            Self::MailIn | Self::MailOut => "MAIL",
            Self::RcptIn | Self::RcptOut => "RCPT",
            Self::DataIn | Self::DataOut => "DATA",
            Self::Message => "MESSAGE",
            Self::Reply => "REPLY",
            Self::Close => "CLOSE",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declaration_order_backs_the_command_gates() {
        // QUIT applies strictly before Close.
        assert!(State::Message < State::Close);
        assert!(State::Reply < State::Close);

        // RSET applies strictly between HeloOut and DataIn.
        assert!(State::MailIn > State::HeloOut && State::MailIn < State::DataIn);
        assert!(State::RcptOut > State::HeloOut && State::RcptOut < State::DataIn);
        assert!(State::HeloIn < State::HeloOut);
        assert!(State::DataOut > State::DataIn);
    }
}
