use std::collections::BTreeMap;
use std::path::Path;

use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;

use crate::error::FixtureError;
use crate::exceptions::taxonomy::ExceptionTag;
use crate::fork::Fork;

const BUNDLED_MAPPERS: &str = include_str!("../../data/exception_mappers.yml");

lazy_static! {
    static ref BUNDLED: Result<ExceptionMapper, String> =
        ExceptionMapper::from_yaml(BUNDLED_MAPPERS).map_err(|err| err.to_string());
}

/// Outcome of translating a raw client error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Mapped(ExceptionTag),
    Unmapped,
}

impl Classification {
    pub fn tag(&self) -> Option<ExceptionTag> {
        match self {
            Self::Mapped(tag) => Some(*tag),
            Self::Unmapped => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ClientEntry {
    #[serde(default)]
    aliases: Vec<String>,
    #[serde(default)]
    rules: Vec<RuleEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleEntry {
    substring: Option<String>,
    regex: Option<String>,
    exception: ExceptionTag,
    fork_from: Option<Fork>,
    fork_until: Option<Fork>,
}

#[derive(Debug, Clone)]
enum Pattern {
    Substring(String),
    Regex(Regex),
}

impl Pattern {
    fn is_match(&self, message: &str) -> bool {
        match self {
            Self::Substring(s) => message.contains(s.as_str()),
            Self::Regex(re) => re.is_match(message),
        }
    }
}

#[derive(Debug, Clone)]
struct Rule {
    pattern: Pattern,
    tag: ExceptionTag,
    fork_from: Option<Fork>,
    fork_until: Option<Fork>,
}

impl Rule {
    /// `fork` is the fork active for the block, as given by [`Fork::at`]. A
    /// bare transition fork is taken past its transition.
    fn applies_to(&self, fork: Option<Fork>) -> bool {
        let Some(fork) = fork.map(Fork::resolved) else {
            return true;
        };
        self.fork_from.map_or(true, |from| fork >= from)
            && self.fork_until.map_or(true, |until| fork < until)
    }
}

#[derive(Debug, Clone, Default)]
struct ClientRules {
    aliases: Vec<String>,
    rules: Vec<Rule>,
}

/// Ordered per-client tables translating raw error text into exception tags.
#[derive(Debug, Clone, Default)]
pub struct ExceptionMapper {
    clients: BTreeMap<String, ClientRules>,
}

impl ExceptionMapper {
    /// Returns the tables shipped with the crate.
    pub fn bundled() -> Result<Self, FixtureError> {
        BUNDLED.clone().map_err(|error| FixtureError::InvalidMapperRule {
            client: String::from("bundled"),
            error,
        })
    }

    /// Parses a mapper YAML document.
    pub fn from_yaml(input: &str) -> Result<Self, FixtureError> {
        let entries: BTreeMap<String, ClientEntry> = serde_yaml::from_str(input)?;
        let mut clients = BTreeMap::new();
        for (client, entry) in entries {
            let rules = entry
                .rules
                .into_iter()
                .map(|rule| compile_rule(&client, rule))
                .collect::<Result<Vec<_>, _>>()?;
            clients.insert(
                client.to_lowercase(),
                ClientRules {
                    aliases: entry.aliases.iter().map(|a| a.to_lowercase()).collect(),
                    rules,
                },
            );
        }
        Ok(Self { clients })
    }

    /// Loads a mapper YAML file.
    pub fn from_file(path: &Path) -> Result<Self, FixtureError> {
        let content = std::fs::read_to_string(path).map_err(|err| FixtureError::Io {
            path: path.to_path_buf(),
            error: err.to_string(),
        })?;
        Self::from_yaml(&content)
    }

    /// Merges `extra` into `self`. For a client present in both, the rules of
    /// `extra` are evaluated first.
    #[must_use]
    pub fn merged(mut self, extra: Self) -> Self {
        for (client, mut extra_rules) in extra.clients {
            let entry = self.clients.entry(client).or_default();
            extra_rules.rules.append(&mut entry.rules);
            entry.rules = extra_rules.rules;
            for alias in extra_rules.aliases {
                if !entry.aliases.contains(&alias) {
                    entry.aliases.push(alias);
                }
            }
        }
        self
    }

    /// Whether a table exists for `client_id`.
    pub fn knows(&self, client_id: &str) -> bool {
        self.rules_for(client_id).is_some()
    }

    /// Classifies `message` using the first rule of the client's table that
    /// matches and applies to `fork`, the fork active for the rejected block.
    pub fn classify(&self, message: &str, client_id: &str, fork: Option<Fork>) -> Classification {
        let Some(rules) = self.rules_for(client_id) else {
            tracing::debug!("No exception mapper for client {client_id}");
            return Classification::Unmapped;
        };
        rules
            .iter()
            .find(|rule| rule.applies_to(fork) && rule.pattern.is_match(message))
            .map_or(Classification::Unmapped, |rule| {
                Classification::Mapped(rule.tag)
            })
    }

    /// Looks the client up by name, then by alias, then by the name stripped
    /// of any `_suffix` (hive client names such as `go-ethereum_default`).
    fn rules_for(&self, client_id: &str) -> Option<&[Rule]> {
        let id = client_id.to_lowercase();
        let lookup = |id: &str| {
            self.clients.get(id).or_else(|| {
                self.clients
                    .values()
                    .find(|client| client.aliases.iter().any(|a| a == id))
            })
        };
        lookup(&id)
            .or_else(|| id.split_once('_').and_then(|(base, _)| lookup(base)))
            .map(|client| client.rules.as_slice())
    }
}

fn compile_rule(client: &str, rule: RuleEntry) -> Result<Rule, FixtureError> {
    let invalid = |error: String| FixtureError::InvalidMapperRule {
        client: client.to_string(),
        error,
    };
    let pattern = match (rule.substring, rule.regex) {
        (Some(s), None) => Pattern::Substring(s),
        (None, Some(re)) => Pattern::Regex(Regex::new(&re).map_err(|e| invalid(e.to_string()))?),
        _ => {
            return Err(invalid(format!(
                "rule for {} needs exactly one of substring or regex",
                rule.exception
            )))
        }
    };
    if let (Some(from), Some(until)) = (rule.fork_from, rule.fork_until) {
        if from >= until {
            return Err(invalid(format!("empty fork range {from}..{until}")));
        }
    }
    Ok(Rule {
        pattern,
        tag: rule.exception,
        fork_from: rule.fork_from,
        fork_until: rule.fork_until,
    })
}
