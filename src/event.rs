use std::fmt;

/// Readiness reported back by a poller for one channel.
///
/// Unlike [`Interest`], which is what a channel asks for, `Ready` is what a
/// wait actually returned: it can additionally carry error and hangup
/// indications, and it can be empty.
///
/// [`Interest`]: crate::Interest
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Ready(u8);

const READABLE: u8 = 0b0001;
const WRITABLE: u8 = 0b0010;
const ERROR: u8 = 0b0100;
const HANGUP: u8 = 0b1000;

impl Ready {
    /// No readiness at all.
    pub const EMPTY: Ready = Ready(0);

    /// Read readiness (including priority/out-of-band data).
    pub const READABLE: Ready = Ready(READABLE);

    /// Write readiness.
    pub const WRITABLE: Ready = Ready(WRITABLE);

    /// An error condition on the descriptor.
    pub const ERROR: Ready = Ready(ERROR);

    /// The peer hung up.
    pub const HANGUP: Ready = Ready(HANGUP);

    /// Combines two readiness sets.
    #[must_use = "this returns the result of the operation, without modifying the original"]
    pub const fn add(self, other: Ready) -> Ready {
        Ready(self.0 | other.0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn is_readable(self) -> bool {
        (self.0 & READABLE) != 0
    }

    pub const fn is_writable(self) -> bool {
        (self.0 & WRITABLE) != 0
    }

    pub const fn is_error(self) -> bool {
        (self.0 & ERROR) != 0
    }

    pub const fn is_hangup(self) -> bool {
        (self.0 & HANGUP) != 0
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "(empty)");
        }
        let mut one = false;
        let mut flag = |f: &mut fmt::Formatter<'_>, set: bool, name: &str| {
            if set {
                if one {
                    write!(f, " | ")?;
                }
                one = true;
                write!(f, "{}", name)?;
            }
            Ok(())
        };
        flag(f, self.is_readable(), "READABLE")?;
        flag(f, self.is_writable(), "WRITABLE")?;
        flag(f, self.is_error(), "ERROR")?;
        flag(f, self.is_hangup(), "HANGUP")?;
        Ok(())
    }
}
