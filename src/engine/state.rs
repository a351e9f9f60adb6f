//! Endpoint state bitmask
//!
//! Local and remote halves move independently:
//! `UNINIT -> ACTIVE -> CLOSED` on each side, giving a 3x3 matrix.
//! `open()`/`close()` only touch the local half.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EndpointState(u8);

impl EndpointState {
    pub const LOCAL_UNINIT: EndpointState = EndpointState(1);
    pub const LOCAL_ACTIVE: EndpointState = EndpointState(2);
    pub const LOCAL_CLOSED: EndpointState = EndpointState(4);
    pub const REMOTE_UNINIT: EndpointState = EndpointState(8);
    pub const REMOTE_ACTIVE: EndpointState = EndpointState(16);
    pub const REMOTE_CLOSED: EndpointState = EndpointState(32);

    pub const LOCAL_MASK: EndpointState = EndpointState(1 | 2 | 4);
    pub const REMOTE_MASK: EndpointState = EndpointState(8 | 16 | 32);

    /// 新分配端点的初始状态
    pub const fn initial() -> Self {
        EndpointState(1 | 8)
    }

    pub const fn empty() -> Self {
        EndpointState(0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn from_bits(bits: u8) -> Self {
        EndpointState(bits & 0x3f)
    }

    pub const fn contains(self, other: EndpointState) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: EndpointState) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn local(self) -> EndpointState {
        EndpointState(self.0 & Self::LOCAL_MASK.0)
    }

    pub const fn remote(self) -> EndpointState {
        EndpointState(self.0 & Self::REMOTE_MASK.0)
    }

    /// 替换本地半边
    pub const fn with_local(self, local: EndpointState) -> EndpointState {
        EndpointState((self.0 & Self::REMOTE_MASK.0) | (local.0 & Self::LOCAL_MASK.0))
    }

    /// 替换远端半边
    pub const fn with_remote(self, remote: EndpointState) -> EndpointState {
        EndpointState((self.0 & Self::LOCAL_MASK.0) | (remote.0 & Self::REMOTE_MASK.0))
    }

    /// 按状态掩码匹配
    ///
    /// 空掩码匹配一切；只给出一侧的掩码时按位相交匹配；
    /// 两侧都给出时要求完全相等。
    pub const fn matches(self, mask: EndpointState) -> bool {
        if mask.0 == 0 {
            return true;
        }
        if mask.0 & Self::REMOTE_MASK.0 == 0 || mask.0 & Self::LOCAL_MASK.0 == 0 {
            self.0 & mask.0 != 0
        } else {
            self.0 == mask.0
        }
    }

    /// 本地与远端都已关闭
    pub const fn is_terminal(self) -> bool {
        self.contains(Self::LOCAL_CLOSED) && self.contains(Self::REMOTE_CLOSED)
    }
}

impl BitOr for EndpointState {
    type Output = EndpointState;

    fn bitor(self, rhs: Self) -> Self::Output {
        EndpointState(self.0 | rhs.0)
    }
}

impl BitOrAssign for EndpointState {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for EndpointState {
    type Output = EndpointState;

    fn bitand(self, rhs: Self) -> Self::Output {
        EndpointState(self.0 & rhs.0)
    }
}

impl fmt::Debug for EndpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(EndpointState, &str); 6] = [
            (EndpointState::LOCAL_UNINIT, "LOCAL_UNINIT"),
            (EndpointState::LOCAL_ACTIVE, "LOCAL_ACTIVE"),
            (EndpointState::LOCAL_CLOSED, "LOCAL_CLOSED"),
            (EndpointState::REMOTE_UNINIT, "REMOTE_UNINIT"),
            (EndpointState::REMOTE_ACTIVE, "REMOTE_ACTIVE"),
            (EndpointState::REMOTE_CLOSED, "REMOTE_CLOSED"),
        ];
        let parts: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if parts.is_empty() {
            f.write_str("EndpointState(empty)")
        } else {
            write!(f, "EndpointState({})", parts.join(" | "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_halves_are_independent() {
        let state = EndpointState::initial()
            .with_local(EndpointState::LOCAL_ACTIVE)
            .with_remote(EndpointState::REMOTE_CLOSED);
        assert_eq!(state.local(), EndpointState::LOCAL_ACTIVE);
        assert_eq!(state.remote(), EndpointState::REMOTE_CLOSED);
        assert!(!state.is_terminal());
        assert!(state.with_local(EndpointState::LOCAL_CLOSED).is_terminal());
    }

    #[test]
    fn test_mask_matching() {
        let active = EndpointState::LOCAL_ACTIVE | EndpointState::REMOTE_ACTIVE;
        let half = EndpointState::LOCAL_ACTIVE | EndpointState::REMOTE_UNINIT;

        // 单侧掩码：相交即匹配
        assert!(active.matches(EndpointState::LOCAL_ACTIVE));
        assert!(half.matches(EndpointState::LOCAL_ACTIVE));
        // 双侧掩码：必须相等
        assert!(active.matches(active));
        assert!(!half.matches(active));
        assert!(half.matches(EndpointState::empty()));
    }

    #[test]
    fn test_debug_lists_flags() {
        let text = format!("{:?}", EndpointState::initial());
        assert_eq!(text, "EndpointState(LOCAL_UNINIT | REMOTE_UNINIT)");
    }
}
