//! Saga state definitions
//!
//! State IDs are stored as SMALLINT. Each enum carries its own transition
//! graph; stores refuse any transition outside it.

use std::fmt;

use super::error::BridgeError;

/// Deposit (mint) saga states
///
/// Terminal states: CONFIRMED (0), MINT_FAILED (4), FALLBACK_CONFIRMED (50),
/// FALLBACK_FAILED (-10)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum DepositState {
    /// Recorded by the scanner, mint not attempted yet
    Pending = 1,

    /// Mint about to be sent (persist-before-call)
    MintInvoked = 10,

    /// Mint accepted, waiting for the receipt
    WaitMined = 20,

    /// Terminal: mint receipt status 1
    Confirmed = 0,

    /// Mint receipt failed or never arrived
    WaitMinedFailed = 3,

    /// Terminal: the rollup already processed this source tx hash
    MintFailed = 4,

    /// Direct transfer to be signed and persisted
    FallbackPending = 30,

    /// Direct transfer persisted and broadcast, waiting for the receipt
    FallbackWaitMined = 40,

    /// Terminal: direct transfer receipt status 1
    FallbackConfirmed = 50,

    /// Terminal: direct transfer failed, needs an operator
    FallbackFailed = -10,
}

impl DepositState {
    pub const ALL: [DepositState; 10] = [
        DepositState::Pending,
        DepositState::MintInvoked,
        DepositState::WaitMined,
        DepositState::Confirmed,
        DepositState::WaitMinedFailed,
        DepositState::MintFailed,
        DepositState::FallbackPending,
        DepositState::FallbackWaitMined,
        DepositState::FallbackConfirmed,
        DepositState::FallbackFailed,
    ];

    /// States the deposit sweep picks up
    pub const ACTIVE: [DepositState; 5] = [
        DepositState::Pending,
        DepositState::WaitMined,
        DepositState::WaitMinedFailed,
        DepositState::FallbackPending,
        DepositState::FallbackWaitMined,
    ];

    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DepositState::Confirmed
                | DepositState::MintFailed
                | DepositState::FallbackConfirmed
                | DepositState::FallbackFailed
        )
    }

    /// Funds reached the rollup account
    #[inline]
    pub fn is_credited(&self) -> bool {
        matches!(
            self,
            DepositState::Confirmed | DepositState::FallbackConfirmed
        )
    }

    pub fn can_transition_to(&self, next: DepositState) -> bool {
        use DepositState::*;
        matches!(
            (self, next),
            (Pending, MintInvoked)
                // retryable mint error
                | (MintInvoked, Pending)
                | (MintInvoked, WaitMined)
                | (MintInvoked, MintFailed)
                | (MintInvoked, FallbackPending)
                | (WaitMined, Confirmed)
                | (WaitMined, WaitMinedFailed)
                | (WaitMinedFailed, FallbackPending)
                | (FallbackPending, FallbackWaitMined)
                | (FallbackPending, FallbackFailed)
                // signed transfer lost its nonce, sign again
                | (FallbackWaitMined, FallbackPending)
                | (FallbackWaitMined, FallbackConfirmed)
                | (FallbackWaitMined, FallbackFailed)
        )
    }

    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        DepositState::ALL.into_iter().find(|s| s.id() == id)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DepositState::Pending => "PENDING",
            DepositState::MintInvoked => "MINT_INVOKED",
            DepositState::WaitMined => "WAIT_MINED",
            DepositState::Confirmed => "CONFIRMED",
            DepositState::WaitMinedFailed => "WAIT_MINED_FAILED",
            DepositState::MintFailed => "MINT_FAILED",
            DepositState::FallbackPending => "FALLBACK_PENDING",
            DepositState::FallbackWaitMined => "FALLBACK_WAIT_MINED",
            DepositState::FallbackConfirmed => "FALLBACK_CONFIRMED",
            DepositState::FallbackFailed => "FALLBACK_FAILED",
        }
    }
}

impl fmt::Display for DepositState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<i16> for DepositState {
    type Error = ();

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        DepositState::from_id(value).ok_or(())
    }
}

/// Denormalized view of the fallback leg, kept in its own column for operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum FallbackStatus {
    Pending = 1,
    WaitMined = 2,
    Success = 0,
    Failed = -1,
}

impl FallbackStatus {
    /// Fallback column value implied by a deposit state
    pub fn for_state(state: DepositState) -> Option<Self> {
        match state {
            DepositState::FallbackPending => Some(FallbackStatus::Pending),
            DepositState::FallbackWaitMined => Some(FallbackStatus::WaitMined),
            DepositState::FallbackConfirmed => Some(FallbackStatus::Success),
            DepositState::FallbackFailed => Some(FallbackStatus::Failed),
            _ => None,
        }
    }

    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(FallbackStatus::Pending),
            2 => Some(FallbackStatus::WaitMined),
            0 => Some(FallbackStatus::Success),
            -1 => Some(FallbackStatus::Failed),
            _ => None,
        }
    }
}

/// Settlement ledger leg of a deposit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum SettlementStatus {
    /// Not yet created on the ledger
    Pending = 1,
    /// Entry exists on the ledger in pending status
    Created = 2,
    /// Terminal: ledger entry marked completed
    Completed = 0,
    /// Terminal: ledger entry disagrees with the local record
    Mismatch = -1,
}

impl SettlementStatus {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SettlementStatus::Completed | SettlementStatus::Mismatch
        )
    }

    pub fn can_transition_to(&self, next: SettlementStatus) -> bool {
        use SettlementStatus::*;
        matches!(
            (self, next),
            (Pending, Created) | (Created, Completed) | (Created, Mismatch)
        )
    }

    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(SettlementStatus::Pending),
            2 => Some(SettlementStatus::Created),
            0 => Some(SettlementStatus::Completed),
            -1 => Some(SettlementStatus::Mismatch),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementStatus::Pending => "PENDING",
            SettlementStatus::Created => "CREATED",
            SettlementStatus::Completed => "COMPLETED",
            SettlementStatus::Mismatch => "MISMATCH",
        }
    }
}

impl fmt::Display for SettlementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Withdrawal saga states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum WithdrawStatus {
    /// Log observed and persisted
    Submitted = 0,
    /// Custody request about to be sent (persist-before-call)
    CustodyPending = 10,
    /// Custody accepted the request, broadcast hash not known yet
    CustodyBroadcast = 20,
    /// Broadcast hash known, waiting for confirmations
    ConfirmWait = 30,
    /// Terminal
    Finalized = 40,
    /// Terminal: custody rejected the request
    CustodyFailed = -10,
}

impl WithdrawStatus {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WithdrawStatus::Finalized | WithdrawStatus::CustodyFailed
        )
    }

    pub fn can_transition_to(&self, next: WithdrawStatus) -> bool {
        use WithdrawStatus::*;
        matches!(
            (self, next),
            (Submitted, CustodyPending)
                | (CustodyPending, CustodyBroadcast)
                | (CustodyPending, CustodyFailed)
                | (CustodyBroadcast, ConfirmWait)
                | (ConfirmWait, Finalized)
        )
    }

    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(WithdrawStatus::Submitted),
            10 => Some(WithdrawStatus::CustodyPending),
            20 => Some(WithdrawStatus::CustodyBroadcast),
            30 => Some(WithdrawStatus::ConfirmWait),
            40 => Some(WithdrawStatus::Finalized),
            -10 => Some(WithdrawStatus::CustodyFailed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WithdrawStatus::Submitted => "SUBMITTED",
            WithdrawStatus::CustodyPending => "CUSTODY_PENDING",
            WithdrawStatus::CustodyBroadcast => "CUSTODY_BROADCAST",
            WithdrawStatus::ConfirmWait => "CONFIRM_WAIT",
            WithdrawStatus::Finalized => "FINALIZED",
            WithdrawStatus::CustodyFailed => "CUSTODY_FAILED",
        }
    }
}

impl fmt::Display for WithdrawStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Reject a transition outside the deposit graph
pub fn ensure_deposit_transition(from: DepositState, to: DepositState) -> Result<(), BridgeError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(BridgeError::InvalidStateTransition(format!(
            "deposit {} -> {}",
            from, to
        )))
    }
}

pub fn ensure_withdraw_transition(
    from: WithdrawStatus,
    to: WithdrawStatus,
) -> Result<(), BridgeError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(BridgeError::InvalidStateTransition(format!(
            "withdraw {} -> {}",
            from, to
        )))
    }
}

pub fn ensure_settlement_transition(
    from: SettlementStatus,
    to: SettlementStatus,
) -> Result<(), BridgeError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(BridgeError::InvalidStateTransition(format!(
            "settlement {} -> {}",
            from, to
        )))
    }
}
