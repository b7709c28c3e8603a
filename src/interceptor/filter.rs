// SPDX-License-Identifier: Apache-2.0

//! Rule Filter
//!
//! Allow/deny evaluation over patterns, tables and operations. The first
//! decisive rule wins, in this order:
//!
//! 1. blacklist patterns
//! 2. blacklist tables
//! 3. whitelist tables (a non-empty whitelist denies every unlisted table)
//! 4. whitelist patterns
//! 5. whitelist operations, then blacklist operations
//!
//! Rules live in an immutable snapshot behind an `Arc`. Evaluation clones
//! the `Arc` and never holds a lock while matching; mutations build a new
//! snapshot and swap it in, so an evaluation never sees half an update.
//! Table names come from [`scan_tables`], which is lexical and therefore
//! approximate for complex SQL. When it cannot read a table reference, a
//! non-empty table whitelist denies the statement.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::classifier;
use super::error::FilterError;
use super::tables::scan_tables;
use super::types::FilterRuleSet;

/// Compiled regex size cap for operator-supplied patterns
const PATTERN_SIZE_LIMIT: usize = 1 << 20;

/// Outcome of a filter evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterDecision {
    Allow,
    Deny { reason: String },
}

impl FilterDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Allow => None,
            Self::Deny { reason } => Some(reason),
        }
    }

    fn deny(reason: String) -> Self {
        Self::Deny { reason }
    }
}

/// Pluggable allow/deny evaluator consulted by the executor
pub trait QueryFilter: Send + Sync {
    fn evaluate(&self, query: &str) -> Result<FilterDecision, FilterError>;
}

/// One of the six rule lists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleList {
    WhitelistPatterns,
    BlacklistPatterns,
    WhitelistTables,
    BlacklistTables,
    WhitelistOperations,
    BlacklistOperations,
}

struct CompiledPattern {
    source: String,
    regex: Result<Regex, String>,
}

impl CompiledPattern {
    fn compile(source: &str) -> Self {
        let regex = RegexBuilder::new(source)
            .case_insensitive(true)
            .size_limit(PATTERN_SIZE_LIMIT)
            .build()
            .map_err(|e| e.to_string());
        Self {
            source: source.to_string(),
            regex,
        }
    }

    fn is_match(&self, query: &str) -> Result<bool, FilterError> {
        match &self.regex {
            Ok(regex) => Ok(regex.is_match(query)),
            Err(message) => Err(FilterError::InvalidPattern {
                pattern: self.source.clone(),
                message: message.clone(),
            }),
        }
    }
}

/// Immutable rule state observed by one evaluation
struct RuleSnapshot {
    rules: FilterRuleSet,
    blacklist: Vec<CompiledPattern>,
    whitelist: Vec<CompiledPattern>,
}

impl RuleSnapshot {
    fn build(rules: FilterRuleSet) -> Self {
        let rules = rules.normalized();
        let blacklist = rules.blacklist_patterns.iter().map(|p| CompiledPattern::compile(p)).collect();
        let whitelist = rules.whitelist_patterns.iter().map(|p| CompiledPattern::compile(p)).collect();
        Self {
            rules,
            blacklist,
            whitelist,
        }
    }

    fn first_invalid(&self) -> Option<FilterError> {
        self.blacklist
            .iter()
            .chain(self.whitelist.iter())
            .find_map(|p| p.regex.as_ref().err().map(|message| FilterError::InvalidPattern {
                pattern: p.source.clone(),
                message: message.clone(),
            }))
    }

    fn evaluate(&self, query: &str) -> Result<FilterDecision, FilterError> {
        let rules = &self.rules;

        for pattern in &self.blacklist {
            if pattern.is_match(query)? {
                return Ok(FilterDecision::deny(format!(
                    "Query matches blacklisted pattern: {}",
                    pattern.source
                )));
            }
        }

        let needs_tables = !rules.blacklist_tables.is_empty() || !rules.whitelist_tables.is_empty();
        if needs_tables {
            let refs = scan_tables(query);
            let tables = &refs.tables;

            if let Some(table) = tables.iter().find(|t| rules.blacklist_tables.contains(*t)) {
                return Ok(FilterDecision::deny(format!("Table '{}' is blacklisted", table)));
            }

            if !rules.whitelist_tables.is_empty() {
                if refs.unresolved {
                    return Ok(FilterDecision::deny(
                        "Query references tables that cannot be checked against the whitelist"
                            .to_string(),
                    ));
                }
                if let Some(table) = tables.iter().find(|t| !rules.whitelist_tables.contains(*t)) {
                    return Ok(FilterDecision::deny(format!(
                        "Table '{}' is not in whitelist",
                        table
                    )));
                }
            }
        }

        if !self.whitelist.is_empty() {
            let mut matched = false;
            for pattern in &self.whitelist {
                if pattern.is_match(query)? {
                    matched = true;
                    break;
                }
            }
            if !matched {
                return Ok(FilterDecision::deny(
                    "Query does not match any whitelisted pattern".to_string(),
                ));
            }
        }

        if !rules.whitelist_operations.is_empty() || !rules.blacklist_operations.is_empty() {
            let category = classifier::classify(query).as_str();
            let keyword = classifier::leading_keyword(query);
            let names: Vec<&str> = std::iter::once(category)
                .chain(keyword.as_deref())
                .collect();

            if !rules.whitelist_operations.is_empty()
                && !names.iter().any(|n| rules.whitelist_operations.contains(*n))
            {
                return Ok(FilterDecision::deny(format!(
                    "Operation '{}' is not in whitelist",
                    category
                )));
            }

            if let Some(name) = names.iter().find(|n| rules.blacklist_operations.contains(**n)) {
                return Ok(FilterDecision::deny(format!("Operation '{}' is blacklisted", name)));
            }
        }

        Ok(FilterDecision::Allow)
    }
}

/// Runtime-mutable allow/deny filter
pub struct RuleFilter {
    current: RwLock<Arc<RuleSnapshot>>,
    /// Serializes writers so concurrent updates do not lose each other
    update_lock: Mutex<()>,
}

impl RuleFilter {
    /// Builds a filter, keeping invalid patterns as evaluation-time errors.
    pub fn new(rules: FilterRuleSet) -> Self {
        let snapshot = RuleSnapshot::build(rules);
        if let Some(err) = snapshot.first_invalid() {
            warn!("Rule filter loaded with an invalid pattern: {}", err);
        }
        Self {
            current: RwLock::new(Arc::new(snapshot)),
            update_lock: Mutex::new(()),
        }
    }

    /// Builds a filter, rejecting any pattern that does not compile.
    pub fn try_new(rules: FilterRuleSet) -> Result<Self, FilterError> {
        let snapshot = RuleSnapshot::build(rules);
        if let Some(err) = snapshot.first_invalid() {
            return Err(err);
        }
        Ok(Self {
            current: RwLock::new(Arc::new(snapshot)),
            update_lock: Mutex::new(()),
        })
    }

    fn load(&self) -> Arc<RuleSnapshot> {
        Arc::clone(&self.current.read())
    }

    /// Copy of the active rule set
    pub fn snapshot(&self) -> FilterRuleSet {
        self.load().rules.clone()
    }

    /// Replaces every rule at once.
    pub fn replace(&self, rules: FilterRuleSet) -> Result<(), FilterError> {
        let snapshot = RuleSnapshot::build(rules);
        if let Some(err) = snapshot.first_invalid() {
            return Err(err);
        }
        let _guard = self.update_lock.lock();
        *self.current.write() = Arc::new(snapshot);
        info!("Filter rules replaced");
        Ok(())
    }

    /// Adds `value` to `list`. Returns false when it was already present.
    pub fn add_rule(&self, list: RuleList, value: &str) -> Result<bool, FilterError> {
        if matches!(list, RuleList::WhitelistPatterns | RuleList::BlacklistPatterns) {
            if let Err(message) = CompiledPattern::compile(value).regex {
                return Err(FilterError::InvalidPattern {
                    pattern: value.to_string(),
                    message,
                });
            }
        }

        let added = self.modify(|rules| match list {
            RuleList::WhitelistPatterns => push_unique(&mut rules.whitelist_patterns, value),
            RuleList::BlacklistPatterns => push_unique(&mut rules.blacklist_patterns, value),
            RuleList::WhitelistTables => rules.whitelist_tables.insert(value.trim().to_lowercase()),
            RuleList::BlacklistTables => rules.blacklist_tables.insert(value.trim().to_lowercase()),
            RuleList::WhitelistOperations => {
                rules.whitelist_operations.insert(value.trim().to_uppercase())
            }
            RuleList::BlacklistOperations => {
                rules.blacklist_operations.insert(value.trim().to_uppercase())
            }
        });

        debug!(list = ?list, value, added, "Filter rule added");
        Ok(added)
    }

    /// Removes `value` from `list`. Returns false when it was absent.
    pub fn remove_rule(&self, list: RuleList, value: &str) -> bool {
        let removed = self.modify(|rules| match list {
            RuleList::WhitelistPatterns => remove_item(&mut rules.whitelist_patterns, value),
            RuleList::BlacklistPatterns => remove_item(&mut rules.blacklist_patterns, value),
            RuleList::WhitelistTables => rules.whitelist_tables.remove(&value.trim().to_lowercase()),
            RuleList::BlacklistTables => rules.blacklist_tables.remove(&value.trim().to_lowercase()),
            RuleList::WhitelistOperations => {
                rules.whitelist_operations.remove(&value.trim().to_uppercase())
            }
            RuleList::BlacklistOperations => {
                rules.blacklist_operations.remove(&value.trim().to_uppercase())
            }
        });

        debug!(list = ?list, value, removed, "Filter rule removed");
        removed
    }

    fn modify(&self, change: impl FnOnce(&mut FilterRuleSet) -> bool) -> bool {
        let _guard = self.update_lock.lock();
        let mut rules = self.load().rules.clone();
        if !change(&mut rules) {
            return false;
        }
        let snapshot = Arc::new(RuleSnapshot::build(rules));
        *self.current.write() = snapshot;
        true
    }
}

impl QueryFilter for RuleFilter {
    fn evaluate(&self, query: &str) -> Result<FilterDecision, FilterError> {
        self.load().evaluate(query)
    }
}

fn push_unique(list: &mut Vec<String>, value: &str) -> bool {
    if list.iter().any(|p| p == value) {
        return false;
    }
    list.push(value.to_string());
    true
}

fn remove_item(list: &mut Vec<String>, value: &str) -> bool {
    let before = list.len();
    list.retain(|p| p != value);
    list.len() != before
}
