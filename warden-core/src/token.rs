//! Single-use approval tokens.
//!
//! Only the SHA-256 digest of a token is persisted. The raw value exists in
//! memory once, inside [`IssuedToken`], and is zeroized when dropped.
//! Token state is derived from an append-only journal of issuance,
//! consumption and revocation rows.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use zeroize::{Zeroize, Zeroizing};
use warden_common::{Journal, Result, SharedClock};

use crate::error::{Denial, GovResult, GovernanceError};
use crate::proposal::ProposalStore;

const TOKEN_BYTES: usize = 32;

/// Hex SHA-256 digest of a token value.
pub fn token_digest(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

fn generate_value() -> Zeroizing<String> {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    let value = Zeroizing::new(URL_SAFE_NO_PAD.encode(bytes));
    bytes.zeroize();
    value
}

/// Persisted view of one token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalToken {
    pub token_id: String,
    pub proposal_id: String,
    pub token_digest: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl ApprovalToken {
    /// Why the token cannot be used at `now`, if it cannot.
    pub fn invalid_reason(&self, now: DateTime<Utc>) -> Option<&'static str> {
        if self.consumed_at.is_some() {
            Some("consumed")
        } else if self.revoked_at.is_some() {
            Some("revoked")
        } else if now >= self.expires_at {
            Some("expired")
        } else {
            None
        }
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.invalid_reason(now).is_none()
    }
}

/// A freshly issued token. The raw value is shown to the approver once.
pub struct IssuedToken {
    value: Zeroizing<String>,
    pub token: ApprovalToken,
}

impl IssuedToken {
    pub fn value(&self) -> &str {
        &self.value
    }
}

impl fmt::Debug for IssuedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedToken")
            .field("value", &"[REDACTED]")
            .field("token", &self.token)
            .finish()
    }
}

/// What `revoke` targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevokeTarget {
    /// A token, by raw value or by digest.
    Token(String),
    /// The valid token of one proposal.
    Proposal(String),
    /// Every valid token.
    All,
}

impl RevokeTarget {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Token(_) => "token",
            Self::Proposal(_) => "proposal",
            Self::All => "all",
        }
    }

    /// Identifier safe to persist: token targets are reduced to a digest.
    pub fn identity(&self) -> String {
        match self {
            Self::Token(raw) => normalize_token_ref(raw),
            Self::Proposal(id) => id.clone(),
            Self::All => "all".to_string(),
        }
    }

    /// Stable digest of the target identity, used to deduplicate audit.
    pub fn digest(&self) -> String {
        token_digest(&format!("revoke:{}:{}", self.kind(), self.identity()))
    }
}

fn is_digest(raw: &str) -> bool {
    raw.len() == 64 && raw.bytes().all(|b| b.is_ascii_hexdigit())
}

/// A 64-char hex string is taken as a digest, anything else as a raw value.
fn normalize_token_ref(raw: &str) -> String {
    let raw = raw.trim();
    if is_digest(raw) {
        raw.to_ascii_lowercase()
    } else {
        token_digest(raw)
    }
}

/// Result of a revocation.
#[derive(Debug, Clone)]
pub struct Revocation {
    pub target: RevokeTarget,
    pub revoked: Vec<ApprovalToken>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
enum TokenRecord {
    Issued {
        token_id: String,
        proposal_id: String,
        token_digest: String,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    },
    Consumed {
        token_digest: String,
        at: DateTime<Utc>,
    },
    Revoked {
        token_digest: String,
        at: DateTime<Utc>,
    },
}

/// Fold the journal into per-token state, in issuance order.
fn fold(rows: &[TokenRecord]) -> Vec<ApprovalToken> {
    let mut tokens: Vec<ApprovalToken> = Vec::new();
    for row in rows {
        match row {
            TokenRecord::Issued {
                token_id,
                proposal_id,
                token_digest,
                issued_at,
                expires_at,
            } => tokens.push(ApprovalToken {
                token_id: token_id.clone(),
                proposal_id: proposal_id.clone(),
                token_digest: token_digest.clone(),
                issued_at: *issued_at,
                expires_at: *expires_at,
                consumed_at: None,
                revoked_at: None,
            }),
            TokenRecord::Consumed { token_digest, at } => {
                if let Some(t) = tokens.iter_mut().find(|t| &t.token_digest == token_digest) {
                    if t.consumed_at.is_none() {
                        t.consumed_at = Some(*at);
                    }
                }
            }
            TokenRecord::Revoked { token_digest, at } => {
                if let Some(t) = tokens.iter_mut().find(|t| &t.token_digest == token_digest) {
                    if t.revoked_at.is_none() {
                        t.revoked_at = Some(*at);
                    }
                }
            }
        }
    }
    tokens
}

fn invalid(reason: &str, digest: &str) -> GovernanceError {
    tracing::warn!(
        reason,
        token_digest = %&digest[..digest.len().min(12)],
        "Token rejected"
    );
    GovernanceError::denied(Denial::InvalidToken, "token rejected")
}

/// Issues, validates, consumes and revokes approval tokens.
pub struct TokenStore {
    journal: Journal<TokenRecord>,
    clock: SharedClock,
    ttl: Duration,
}

impl TokenStore {
    pub fn open(
        path: &Path,
        lock_timeout: std::time::Duration,
        clock: SharedClock,
        ttl: Duration,
    ) -> Result<Self> {
        Ok(Self {
            journal: Journal::open(path, lock_timeout)?,
            clock,
            ttl,
        })
    }

    pub fn in_memory(clock: SharedClock, ttl: Duration) -> Self {
        Self {
            journal: Journal::in_memory(),
            clock,
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issue a token for a pending proposal with no valid token.
    ///
    /// The proposal stays locked while the token is written, so it cannot
    /// finish in between.
    pub fn issue(&self, proposals: &ProposalStore, proposal_id: &str) -> GovResult<IssuedToken> {
        let now = self.clock.now();
        let expires_at = now + self.ttl;
        let value = generate_value();
        let digest = token_digest(&value);
        let token_id = uuid::Uuid::new_v4().to_string();

        let token = proposals.with_pending(proposal_id, None, || {
            self.journal.transact(|rows| {
                if fold(rows)
                    .iter()
                    .any(|t| t.proposal_id == proposal_id && t.is_valid_at(now))
                {
                    return Err(GovernanceError::denied(
                        Denial::AlreadyApproved,
                        format!("{proposal_id} already has a valid token"),
                    ));
                }
                let token = ApprovalToken {
                    token_id: token_id.clone(),
                    proposal_id: proposal_id.to_string(),
                    token_digest: digest.clone(),
                    issued_at: now,
                    expires_at,
                    consumed_at: None,
                    revoked_at: None,
                };
                let row = TokenRecord::Issued {
                    token_id,
                    proposal_id: proposal_id.to_string(),
                    token_digest: digest,
                    issued_at: now,
                    expires_at,
                };
                Ok((token, vec![row]))
            })
        })?;

        tracing::info!(
            proposal_id,
            token_id = %token.token_id,
            expires_at = %token.expires_at,
            "Approval token issued"
        );
        Ok(IssuedToken { value, token })
    }

    /// Look up a token and check it is usable. Every failure is the same
    /// `InvalidToken`; the reason is only logged.
    pub fn validate(&self, value: &str) -> GovResult<ApprovalToken> {
        let digest = token_digest(value);
        let now = self.clock.now();
        let rows = self.journal.snapshot()?;
        let Some(token) = fold(&rows).into_iter().find(|t| t.token_digest == digest) else {
            return Err(invalid("missing", &digest));
        };
        match token.invalid_reason(now) {
            Some(reason) => Err(invalid(reason, &digest)),
            None => Ok(token),
        }
    }

    /// Consume a token bound to `proposal_id`. Succeeds at most once per
    /// token, across handles and processes.
    pub fn consume(&self, value: &str, proposal_id: &str) -> GovResult<ApprovalToken> {
        let digest = token_digest(value);
        let now = self.clock.now();
        let token = self.journal.transact(|rows| {
            let Some(mut token) = fold(rows).into_iter().find(|t| t.token_digest == digest) else {
                return Err(invalid("missing", &digest));
            };
            if let Some(reason) = token.invalid_reason(now) {
                return Err(invalid(reason, &digest));
            }
            if token.proposal_id != proposal_id {
                return Err(invalid("proposal_mismatch", &digest));
            }
            token.consumed_at = Some(now);
            let row = TokenRecord::Consumed {
                token_digest: digest.clone(),
                at: now,
            };
            Ok((token, vec![row]))
        })?;
        tracing::info!(proposal_id, token_id = %token.token_id, "Approval token consumed");
        Ok(token)
    }

    /// Revoke every still-valid token matching `target`.
    ///
    /// Tokens already consumed, revoked or expired are never touched, so
    /// repeating a revocation changes nothing.
    pub fn revoke(&self, target: RevokeTarget) -> GovResult<Revocation> {
        let now = self.clock.now();
        let token_ref = match &target {
            RevokeTarget::Token(raw) => Some(normalize_token_ref(raw)),
            _ => None,
        };
        let revoked = self.journal.transact(|rows| {
            let revoked: Vec<ApprovalToken> = fold(rows)
                .into_iter()
                .filter(|t| t.is_valid_at(now))
                .filter(|t| match &target {
                    RevokeTarget::Token(_) => token_ref.as_deref() == Some(t.token_digest.as_str()),
                    RevokeTarget::Proposal(id) => &t.proposal_id == id,
                    RevokeTarget::All => true,
                })
                .map(|mut t| {
                    t.revoked_at = Some(now);
                    t
                })
                .collect();
            let appended = revoked
                .iter()
                .map(|t| TokenRecord::Revoked {
                    token_digest: t.token_digest.clone(),
                    at: now,
                })
                .collect();
            Ok::<_, GovernanceError>((revoked, appended))
        })?;

        tracing::info!(
            target_kind = target.kind(),
            revoked = revoked.len(),
            "Tokens revoked"
        );
        Ok(Revocation { target, revoked })
    }

    /// The currently valid token of a proposal, if any.
    pub fn valid_for_proposal(&self, proposal_id: &str) -> Result<Option<ApprovalToken>> {
        let now = self.clock.now();
        let rows = self.journal.snapshot()?;
        Ok(fold(&rows)
            .into_iter()
            .find(|t| t.proposal_id == proposal_id && t.is_valid_at(now)))
    }

    /// Every token ever issued, in issuance order.
    pub fn all(&self) -> Result<Vec<ApprovalToken>> {
        Ok(fold(&self.journal.snapshot()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proposal::{ExecutionStep, Scope, TerminalOutcome};
    use crate::registry::CapabilityRegistry;
    use chrono::TimeZone;
    use serde_json::json;
    use std::path::PathBuf;
    use std::sync::Arc;
    use tempfile::TempDir;
    use warden_common::FixedClock;

    struct Fixture {
        _tmp: TempDir,
        root: PathBuf,
        clock: FixedClock,
        proposals: ProposalStore,
        tokens: TokenStore,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        let doc = json!({"capabilities": {"file.write_scoped": {
            "tier": "approval_required", "allowed_roots": [root]
        }}});
        let registry = Arc::new(CapabilityRegistry::from_json(&doc.to_string(), &root).unwrap());
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap());
        let shared: SharedClock = Arc::new(clock.clone());
        Fixture {
            proposals: ProposalStore::in_memory(registry, shared.clone()),
            tokens: TokenStore::in_memory(shared, Duration::seconds(300)),
            _tmp: tmp,
            root,
            clock,
        }
    }

    fn propose(f: &Fixture) -> String {
        f.proposals
            .create(
                "file.write_scoped",
                Scope::Paths(vec![f.root.clone()]),
                vec![ExecutionStep::write_file(f.root.join("a.txt"), "x")],
                "s",
                None,
            )
            .unwrap()
            .id
    }

    #[test]
    fn issued_value_is_unguessable_and_not_persisted() {
        let f = fixture();
        let id = propose(&f);
        let issued = f.tokens.issue(&f.proposals, &id).unwrap();
        assert_eq!(issued.value().len(), 43);
        assert_eq!(issued.token.token_digest, token_digest(issued.value()));
        assert!(!format!("{issued:?}").contains(issued.value()));
    }

    #[test]
    fn validate_then_consume_once() {
        let f = fixture();
        let id = propose(&f);
        let issued = f.tokens.issue(&f.proposals, &id).unwrap();

        assert_eq!(f.tokens.validate(issued.value()).unwrap().proposal_id, id);
        f.tokens.consume(issued.value(), &id).unwrap();

        let err = f.tokens.consume(issued.value(), &id).unwrap_err();
        assert_eq!(err.denial(), Some(Denial::InvalidToken));
        let err = f.tokens.validate(issued.value()).unwrap_err();
        assert_eq!(err.denial(), Some(Denial::InvalidToken));
    }

    #[test]
    fn finished_proposal_gets_no_token_and_keeps_existing_one_unspent() {
        let f = fixture();
        let id = propose(&f);
        let issued = f.tokens.issue(&f.proposals, &id).unwrap();
        f.proposals.mark_terminal(&id, TerminalOutcome::Denied).unwrap();

        let err = f
            .proposals
            .with_pending(&id, Some(TerminalOutcome::Executed), || {
                f.tokens.consume(issued.value(), &id)
            })
            .unwrap_err();
        assert_eq!(err.denial(), Some(Denial::ProposalTerminal));
        assert!(f.tokens.all().unwrap()[0].consumed_at.is_none());

        f.tokens.revoke(RevokeTarget::Proposal(id.clone())).unwrap();
        let err = f.tokens.issue(&f.proposals, &id).unwrap_err();
        assert_eq!(err.denial(), Some(Denial::ProposalTerminal));
        assert_eq!(f.tokens.all().unwrap().len(), 1);
    }

    #[test]
    fn unknown_token_is_invalid() {
        let f = fixture();
        let err = f.tokens.validate("not-a-token").unwrap_err();
        assert_eq!(err.denial(), Some(Denial::InvalidToken));
    }

    #[test]
    fn consume_rejects_other_proposal() {
        let f = fixture();
        let a = propose(&f);
        let b = propose(&f);
        let issued = f.tokens.issue(&f.proposals, &a).unwrap();
        let err = f.tokens.consume(issued.value(), &b).unwrap_err();
        assert_eq!(err.denial(), Some(Denial::InvalidToken));
        assert!(f.tokens.validate(issued.value()).is_ok());
    }

    #[test]
    fn one_valid_token_per_proposal() {
        let f = fixture();
        let id = propose(&f);
        f.tokens.issue(&f.proposals, &id).unwrap();
        let err = f.tokens.issue(&f.proposals, &id).unwrap_err();
        assert_eq!(err.denial(), Some(Denial::AlreadyApproved));
    }

    #[test]
    fn expiry_uses_clock() {
        let f = fixture();
        let id = propose(&f);
        let issued = f.tokens.issue(&f.proposals, &id).unwrap();

        f.clock.advance(Duration::seconds(299));
        assert!(f.tokens.validate(issued.value()).is_ok());

        f.clock.advance(Duration::seconds(1));
        let err = f.tokens.validate(issued.value()).unwrap_err();
        assert_eq!(err.denial(), Some(Denial::InvalidToken));
        assert!(f.tokens.valid_for_proposal(&id).unwrap().is_none());

        // An expired token no longer blocks a fresh approval.
        assert!(f.tokens.issue(&f.proposals, &id).is_ok());
    }

    #[test]
    fn terminal_or_unknown_proposal_cannot_be_approved() {
        let f = fixture();
        let id = propose(&f);
        f.proposals
            .mark_terminal(&id, TerminalOutcome::Denied)
            .unwrap();
        let err = f.tokens.issue(&f.proposals, &id).unwrap_err();
        assert_eq!(err.denial(), Some(Denial::ProposalTerminal));

        let err = f.tokens.issue(&f.proposals, "missing").unwrap_err();
        assert_eq!(err.denial(), Some(Denial::UnknownProposal));
    }

    #[test]
    fn revoke_by_value_digest_proposal_and_all() {
        let f = fixture();
        let ids: Vec<String> = (0..4).map(|_| propose(&f)).collect();
        let issued: Vec<IssuedToken> = ids
            .iter()
            .map(|id| f.tokens.issue(&f.proposals, id).unwrap())
            .collect();

        let r = f
            .tokens
            .revoke(RevokeTarget::Token(issued[0].value().to_string()))
            .unwrap();
        assert_eq!(r.revoked.len(), 1);

        let r = f
            .tokens
            .revoke(RevokeTarget::Token(issued[1].token.token_digest.clone()))
            .unwrap();
        assert_eq!(r.revoked.len(), 1);

        let r = f.tokens.revoke(RevokeTarget::Proposal(ids[2].clone())).unwrap();
        assert_eq!(r.revoked[0].proposal_id, ids[2]);

        let r = f.tokens.revoke(RevokeTarget::All).unwrap();
        assert_eq!(r.revoked.len(), 1);
        assert_eq!(r.revoked[0].proposal_id, ids[3]);

        for t in &issued {
            assert!(f.tokens.validate(t.value()).is_err());
        }
    }

    #[test]
    fn revoke_skips_consumed_and_revoked_rows() {
        let f = fixture();
        let a = propose(&f);
        let b = propose(&f);
        let ta = f.tokens.issue(&f.proposals, &a).unwrap();
        f.tokens.issue(&f.proposals, &b).unwrap();
        f.tokens.consume(ta.value(), &a).unwrap();

        assert_eq!(f.tokens.revoke(RevokeTarget::All).unwrap().revoked.len(), 1);
        assert!(f.tokens.revoke(RevokeTarget::All).unwrap().revoked.is_empty());

        let consumed = f
            .tokens
            .all()
            .unwrap()
            .into_iter()
            .find(|t| t.proposal_id == a)
            .unwrap();
        assert!(consumed.consumed_at.is_some());
        assert!(consumed.revoked_at.is_none());
    }

    #[test]
    fn target_digest_is_stable() {
        let by_value = RevokeTarget::Token("abc".into());
        let by_digest = RevokeTarget::Token(token_digest("abc").to_uppercase());
        assert_eq!(by_value.digest(), by_digest.digest());
        assert_ne!(
            RevokeTarget::Proposal("x".into()).digest(),
            RevokeTarget::All.digest()
        );
    }

    #[test]
    fn file_backed_store_shares_state_between_handles() {
        let f = fixture();
        let path = f.root.join("state/tokens.jsonl");
        let clock: SharedClock = Arc::new(f.clock.clone());
        let a = TokenStore::open(&path, std::time::Duration::from_secs(1), clock.clone(), Duration::seconds(300)).unwrap();
        let b = TokenStore::open(&path, std::time::Duration::from_secs(1), clock, Duration::seconds(300)).unwrap();

        let id = propose(&f);
        let issued = a.issue(&f.proposals, &id).unwrap();
        b.consume(issued.value(), &id).unwrap();
        let err = a.consume(issued.value(), &id).unwrap_err();
        assert_eq!(err.denial(), Some(Denial::InvalidToken));

        let persisted = std::fs::read_to_string(&path).unwrap();
        assert!(!persisted.contains(issued.value()));
    }
}
