//! Turn command lexicon.
//!
//! ```text
//! propose <capability> write <path> <content...> [--scope <dir>]
//! propose <capability> run [--cwd <dir>] <program> [args...]
//! approve [proposal_id]
//! deny|reject [proposal_id]
//! revoke <token|proposal_id|all>
//! execute <proposal_id> <token>
//! ```
//!
//! Verbs are case-insensitive; arguments may be quoted with `'…'` or `"…"`.

use std::fmt;
use std::path::{Path, PathBuf};
use warden_tools::security::{canonical_command, normalize_lexically, split_words};
use zeroize::Zeroizing;

use crate::proposal::{ExecutionStep, Scope};

/// The five command shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Propose,
    Approve,
    Deny,
    Revoke,
    Execute,
}

impl Verb {
    fn parse(word: &str) -> Option<Self> {
        match word.to_ascii_lowercase().as_str() {
            "propose" => Some(Self::Propose),
            "approve" => Some(Self::Approve),
            "deny" | "reject" => Some(Self::Deny),
            "revoke" => Some(Self::Revoke),
            "execute" => Some(Self::Execute),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Propose => "propose",
            Self::Approve => "approve",
            Self::Deny => "deny",
            Self::Revoke => "revoke",
            Self::Execute => "execute",
        }
    }
}

/// A parsed turn command.
pub enum TurnCommand {
    Propose {
        capability: String,
        scope: Scope,
        steps: Vec<ExecutionStep>,
        summary: Option<String>,
    },
    Approve {
        proposal_id: Option<String>,
    },
    Deny {
        proposal_id: Option<String>,
    },
    Revoke {
        target: String,
    },
    Execute {
        proposal_id: String,
        token: Zeroizing<String>,
    },
}

impl TurnCommand {
    pub fn verb(&self) -> Verb {
        match self {
            Self::Propose { .. } => Verb::Propose,
            Self::Approve { .. } => Verb::Approve,
            Self::Deny { .. } => Verb::Deny,
            Self::Revoke { .. } => Verb::Revoke,
            Self::Execute { .. } => Verb::Execute,
        }
    }
}

impl fmt::Debug for TurnCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Propose {
                capability,
                scope,
                steps,
                ..
            } => f
                .debug_struct("Propose")
                .field("capability", capability)
                .field("scope", scope)
                .field("steps", &steps.len())
                .finish(),
            Self::Approve { proposal_id } => {
                f.debug_struct("Approve").field("proposal_id", proposal_id).finish()
            }
            Self::Deny { proposal_id } => {
                f.debug_struct("Deny").field("proposal_id", proposal_id).finish()
            }
            Self::Revoke { .. } => f.debug_struct("Revoke").finish_non_exhaustive(),
            Self::Execute { proposal_id, .. } => f
                .debug_struct("Execute")
                .field("proposal_id", proposal_id)
                .finish_non_exhaustive(),
        }
    }
}

/// Why a command line could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    /// The verb, when the first word was recognizable.
    pub verb: Option<Verb>,
    /// The first argument, when the verb takes a proposal id first.
    pub proposal_id: Option<String>,
    pub detail: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.detail)
    }
}

impl std::error::Error for ParseError {}

fn fail(verb: Option<Verb>, detail: impl Into<String>) -> ParseError {
    ParseError {
        verb,
        proposal_id: None,
        detail: detail.into(),
    }
}

/// Parse one command line. Relative paths resolve against `cwd`.
pub fn parse(line: &str, cwd: &Path) -> Result<TurnCommand, ParseError> {
    let first = line.split_whitespace().next().unwrap_or_default();
    let verb = Verb::parse(first);
    let words = split_words(line).map_err(|e| fail(verb, e))?;
    let Some((head, rest)) = words.split_first() else {
        return Err(fail(None, "empty command"));
    };
    let verb = Verb::parse(head).ok_or_else(|| fail(None, format!("unknown command `{head}`")))?;

    match verb {
        Verb::Propose => parse_propose(rest, cwd),
        Verb::Approve => Ok(TurnCommand::Approve {
            proposal_id: optional_id(verb, rest)?,
        }),
        Verb::Deny => Ok(TurnCommand::Deny {
            proposal_id: optional_id(verb, rest)?,
        }),
        Verb::Revoke => match rest {
            [target] if !target.trim().is_empty() => Ok(TurnCommand::Revoke {
                target: target.trim().to_string(),
            }),
            _ => Err(fail(Some(verb), "usage: revoke <token|proposal_id|all>")),
        },
        Verb::Execute => match rest {
            [id, token] if !id.trim().is_empty() && !token.trim().is_empty() => {
                Ok(TurnCommand::Execute {
                    proposal_id: id.trim().to_string(),
                    token: Zeroizing::new(token.trim().to_string()),
                })
            }
            _ => Err(ParseError {
                verb: Some(verb),
                proposal_id: rest.first().map(|s| s.trim().to_string()),
                detail: "usage: execute <proposal_id> <token>".into(),
            }),
        },
    }
}

fn optional_id(verb: Verb, rest: &[String]) -> Result<Option<String>, ParseError> {
    match rest {
        [] => Ok(None),
        [id] if !id.trim().is_empty() => Ok(Some(id.trim().to_string())),
        _ => Err(fail(
            Some(verb),
            format!("usage: {} [proposal_id]", verb.as_str()),
        )),
    }
}

fn absolute(raw: &str, cwd: &Path) -> PathBuf {
    let path = Path::new(raw);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}

/// Remove `flag <value>` from `words`, returning the value.
fn take_flag(words: &mut Vec<String>, flag: &str) -> Result<Option<String>, ParseError> {
    let Some(pos) = words.iter().position(|w| w == flag) else {
        return Ok(None);
    };
    if pos + 1 >= words.len() {
        return Err(fail(Some(Verb::Propose), format!("{flag} needs a value")));
    }
    let value = words.remove(pos + 1);
    words.remove(pos);
    Ok(Some(value))
}

fn parse_propose(rest: &[String], cwd: &Path) -> Result<TurnCommand, ParseError> {
    let usage = "usage: propose <capability> write <path> <content...> [--scope <dir>] \
                 | propose <capability> run [--cwd <dir>] <program> [args...]";
    let [capability, op, args @ ..] = rest else {
        return Err(fail(Some(Verb::Propose), usage));
    };
    let capability = capability.trim().to_string();
    if capability.is_empty() {
        return Err(fail(Some(Verb::Propose), usage));
    }

    match op.to_ascii_lowercase().as_str() {
        "write" => {
            let mut args = args.to_vec();
            let scope_dir = take_flag(&mut args, "--scope")?;
            let [path, content @ ..] = args.as_slice() else {
                return Err(fail(Some(Verb::Propose), usage));
            };
            if content.is_empty() {
                return Err(fail(Some(Verb::Propose), "write needs content"));
            }
            let target = absolute(path, cwd);
            let scope_path = match scope_dir {
                Some(dir) => absolute(&dir, cwd),
                None => normalize_lexically(&target)
                    .parent()
                    .map(Path::to_path_buf)
                    .ok_or_else(|| fail(Some(Verb::Propose), "path has no parent"))?,
            };
            Ok(TurnCommand::Propose {
                summary: Some(format!("write {}", target.display())),
                capability,
                scope: Scope::Paths(vec![scope_path]),
                steps: vec![ExecutionStep::WriteFile {
                    path: target,
                    content: content.join(" "),
                }],
            })
        }
        "run" => {
            let mut args = args.to_vec();
            // Only a leading --cwd belongs to us; later ones are program args.
            let dir = if args.first().map(String::as_str) == Some("--cwd") {
                take_flag(&mut args, "--cwd")?
            } else {
                None
            };
            let Some((program, program_args)) = args.split_first() else {
                return Err(fail(Some(Verb::Propose), usage));
            };
            let cwd = dir.map_or_else(|| cwd.to_path_buf(), |d| absolute(&d, cwd));
            let command = canonical_command(program, program_args);
            Ok(TurnCommand::Propose {
                summary: Some(format!("run {command}")),
                capability,
                scope: Scope::Commands(vec![command]),
                steps: vec![ExecutionStep::RunCommand {
                    program: program.clone(),
                    args: program_args.to_vec(),
                    cwd,
                }],
            })
        }
        other => Err(fail(
            Some(Verb::Propose),
            format!("unknown operation `{other}`; expected write or run"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn cwd() -> PathBuf {
        PathBuf::from("/work")
    }

    #[test]
    fn propose_write_defaults_scope_to_parent() {
        let cmd = parse(
            r#"propose file.write_scoped write /data/reports/q3.txt "Q3 revenue" up"#,
            &cwd(),
        )
        .unwrap();
        match cmd {
            TurnCommand::Propose {
                capability,
                scope,
                steps,
                ..
            } => {
                assert_eq!(capability, "file.write_scoped");
                assert_eq!(scope, Scope::Paths(vec!["/data/reports".into()]));
                assert_eq!(
                    steps,
                    vec![ExecutionStep::write_file("/data/reports/q3.txt", "Q3 revenue up")]
                );
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn propose_write_with_explicit_scope_and_relative_path() {
        let cmd = parse(
            "propose file.write_scoped write notes/a.txt hello --scope notes",
            &cwd(),
        )
        .unwrap();
        match cmd {
            TurnCommand::Propose { scope, steps, .. } => {
                assert_eq!(scope, Scope::Paths(vec!["/work/notes".into()]));
                assert_eq!(
                    steps,
                    vec![ExecutionStep::write_file("/work/notes/a.txt", "hello")]
                );
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn propose_run_scope_is_canonical_command() {
        let cmd = parse(
            r#"PROPOSE shell.exec_scoped RUN --cwd /srv Backup.sh --label "nightly run""#,
            &cwd(),
        )
        .unwrap();
        match cmd {
            TurnCommand::Propose { scope, steps, .. } => {
                assert_eq!(
                    scope,
                    Scope::Commands(vec![r#"backup.sh --label "nightly run""#.into()])
                );
                assert_eq!(
                    steps,
                    vec![ExecutionStep::run_command(
                        "Backup.sh",
                        ["--label", "nightly run"],
                        "/srv"
                    )]
                );
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn run_flags_after_program_are_args() {
        let cmd = parse("propose shell run ls --cwd x", &cwd()).unwrap();
        match cmd {
            TurnCommand::Propose { steps, .. } => {
                assert_eq!(steps, vec![ExecutionStep::run_command("ls", ["--cwd", "x"], "/work")]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn approve_and_deny_ids_are_optional() {
        assert!(matches!(
            parse("approve", &cwd()).unwrap(),
            TurnCommand::Approve { proposal_id: None }
        ));
        assert!(matches!(
            parse("Reject abc", &cwd()).unwrap(),
            TurnCommand::Deny { proposal_id: Some(ref id) } if id == "abc"
        ));
    }

    #[test]
    fn execute_keeps_token() {
        match parse("execute p1 tok-123", &cwd()).unwrap() {
            TurnCommand::Execute { proposal_id, token } => {
                assert_eq!(proposal_id, "p1");
                assert_eq!(token.as_str(), "tok-123");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn debug_never_shows_token() {
        let cmd = parse("execute p1 super-secret-token", &cwd()).unwrap();
        assert!(!format!("{cmd:?}").contains("super-secret-token"));
    }

    #[test_case("", None ; "empty")]
    #[test_case("launch rockets", None ; "unknown verb")]
    #[test_case("execute p1", Some(Verb::Execute) ; "execute missing token")]
    #[test_case("execute", Some(Verb::Execute) ; "execute bare")]
    #[test_case("revoke", Some(Verb::Revoke) ; "revoke bare")]
    #[test_case("approve a b", Some(Verb::Approve) ; "approve two ids")]
    #[test_case("propose cap", Some(Verb::Propose) ; "propose incomplete")]
    #[test_case("propose cap write /a/b", Some(Verb::Propose) ; "write without content")]
    #[test_case("propose cap delete /a", Some(Verb::Propose) ; "unknown op")]
    #[test_case("propose cap write '/a/b x", Some(Verb::Propose) ; "unterminated quote")]
    fn malformed(line: &str, verb: Option<Verb>) {
        let err = parse(line, &cwd()).unwrap_err();
        assert_eq!(err.verb, verb);
        assert!(!err.detail.is_empty());
    }

    #[test]
    fn malformed_execute_keeps_proposal_id() {
        let err = parse("execute p1", &cwd()).unwrap_err();
        assert_eq!(err.proposal_id.as_deref(), Some("p1"));
    }
}
