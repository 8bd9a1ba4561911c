//! The socket lifecycle bitset and the guards protecting each public operation.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use crate::ensure;
use crate::socket::SocketError;

/// Lifecycle flags of a [`Socket`](crate::socket::Socket).
///
/// `NOT_CONNECTED` is the empty set. `CLOSED` is only ever set together with both
/// `WRITE_ENDED` and `READ_ENDED`, or together with `ERROR`; `DISPOSED` is terminal.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SocketState(u8);

impl SocketState {
    pub const NOT_CONNECTED: Self = Self(0);
    pub const CONNECTING: Self = Self(1);
    pub const CONNECTED: Self = Self(1 << 1);
    pub const WRITE_ENDED: Self = Self(1 << 2);
    pub const READ_ENDED: Self = Self(1 << 3);
    pub const CLOSED: Self = Self(1 << 4);
    pub const DISPOSED: Self = Self(1 << 5);
    pub const ERROR: Self = Self(1 << 6);

    const NAMES: [(Self, &'static str); 7] = [
        (Self::CONNECTING, "Connecting"),
        (Self::CONNECTED, "Connected"),
        (Self::WRITE_ENDED, "WriteEnded"),
        (Self::READ_ENDED, "ReadEnded"),
        (Self::CLOSED, "Closed"),
        (Self::DISPOSED, "Disposed"),
        (Self::ERROR, "Error"),
    ];

    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Whether every flag of `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    pub const fn is_connected(self) -> bool {
        self.contains(Self::CONNECTED)
    }

    pub const fn is_closed(self) -> bool {
        self.contains(Self::CLOSED)
    }

    pub const fn is_disposed(self) -> bool {
        self.contains(Self::DISPOSED)
    }

    /// Both halves have ended, the socket may be closed.
    pub const fn both_ended(self) -> bool {
        self.contains(Self::WRITE_ENDED.union(Self::READ_ENDED))
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub(crate) fn ensure_not_disposed(self) -> Result<(), SocketError> {
        ensure!(!self.is_disposed(), SocketError::ObjectDisposed);
        Ok(())
    }

    pub(crate) fn ensure_can_connect(self) -> Result<(), SocketError> {
        self.ensure_not_disposed()?;
        ensure!(self == Self::NOT_CONNECTED, SocketError::state_conflict("connect", self));
        Ok(())
    }

    /// `write` and `end` both need an open send half.
    pub(crate) fn ensure_can_send(self, operation: &'static str) -> Result<(), SocketError> {
        self.ensure_not_disposed()?;
        ensure!(
            self.is_connected() && !self.intersects(Self::WRITE_ENDED.union(Self::CLOSED)),
            SocketError::state_conflict(operation, self)
        );
        Ok(())
    }
}

impl BitOr for SocketState {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl BitOrAssign for SocketState {
    fn bitor_assign(&mut self, rhs: Self) {
        self.insert(rhs);
    }
}

impl fmt::Display for SocketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::NOT_CONNECTED {
            return f.write_str("NotConnected");
        }

        let mut first = true;
        for (flag, name) in Self::NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for SocketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SocketState({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_flags() {
        assert_eq!(SocketState::NOT_CONNECTED.to_string(), "NotConnected");
        assert_eq!((SocketState::CONNECTED | SocketState::WRITE_ENDED).to_string(), "Connected|WriteEnded");
        assert_eq!(SocketState::DISPOSED.to_string(), "Disposed");
    }

    #[test]
    fn connect_only_from_not_connected() {
        assert!(SocketState::NOT_CONNECTED.ensure_can_connect().is_ok());

        let err = SocketState::CONNECTING.ensure_can_connect().unwrap_err();
        assert!(matches!(err, SocketError::StateConflict { operation: "connect", state } if state == SocketState::CONNECTING));

        let err = SocketState::CONNECTED.ensure_can_connect().unwrap_err();
        assert!(matches!(err, SocketError::StateConflict { state, .. } if state == SocketState::CONNECTED));
    }

    #[test]
    fn send_needs_open_write_half() {
        assert!(SocketState::CONNECTED.ensure_can_send("write").is_ok());
        assert!((SocketState::CONNECTED | SocketState::READ_ENDED).ensure_can_send("write").is_ok());

        for state in [
            SocketState::NOT_CONNECTED,
            SocketState::CONNECTING,
            SocketState::CONNECTED | SocketState::WRITE_ENDED,
            SocketState::CONNECTED | SocketState::ERROR | SocketState::CLOSED,
        ] {
            assert!(matches!(state.ensure_can_send("end"), Err(SocketError::StateConflict { operation: "end", .. })));
        }
    }

    #[test]
    fn disposed_wins_over_conflicts() {
        let state = SocketState::CONNECTED | SocketState::DISPOSED;
        assert!(matches!(state.ensure_can_send("write"), Err(SocketError::ObjectDisposed)));
        assert!(matches!(state.ensure_can_connect(), Err(SocketError::ObjectDisposed)));
    }

    #[test]
    fn both_ended() {
        let mut state = SocketState::CONNECTED | SocketState::WRITE_ENDED;
        assert!(!state.both_ended());
        state |= SocketState::READ_ENDED;
        assert!(state.both_ended());
        state.remove(SocketState::WRITE_ENDED);
        assert!(!state.both_ended());
    }
}
