//! Lexical table-reference extraction
//!
//! Finds the base tables a statement touches without parsing it. Names are
//! picked up after `FROM`, `JOIN`, `INTO`, `UPDATE` and `TABLE`, including
//! comma-separated lists and tables inside subqueries and CTE bodies.
//! Schema-qualified names keep only the table component, aliases are
//! skipped, and names declared by a `WITH` clause are dropped.
//!
//! Known limits: vendor-specific syntax, table functions and identifiers
//! written as double-quoted strings (`ANSI_QUOTES`) are not recognised.
//! A table keyword followed by anything other than a readable name marks
//! the scan as unresolved, and a table whitelist refuses such statements.

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Quoted(String),
    Dot,
    Comma,
    LParen,
    RParen,
    Other,
}

impl Token {
    fn keyword(&self) -> Option<String> {
        match self {
            Token::Word(w) => Some(w.to_ascii_uppercase()),
            _ => None,
        }
    }

    fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self, Token::Word(w) if w.eq_ignore_ascii_case(keyword))
    }

    fn name(&self) -> Option<&str> {
        match self {
            Token::Word(w) | Token::Quoted(w) => Some(w),
            _ => None,
        }
    }
}

fn tokenize(query: &str) -> Vec<Token> {
    let chars: Vec<char> = query.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        if c.is_whitespace() {
            i += 1;
        } else if c == '#' || (c == '-' && next == Some('-') && chars.get(i + 2).map_or(true, |n| n.is_whitespace())) {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
        } else if c == '/' && next == Some('*') {
            if chars.get(i + 2) == Some(&'!') {
                // Versioned comment: its body runs, so tokenize it
                i += 3;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
            } else {
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    i += 1;
                }
                i += 2;
            }
        } else if c == '*' && next == Some('/') {
            // Close of a versioned comment
            i += 2;
        } else if c == '\'' || c == '"' {
            i = skip_string(&chars, i + 1, c);
            tokens.push(Token::Other);
        } else if c == '`' {
            let mut ident = String::new();
            i += 1;
            while i < chars.len() {
                if chars[i] == '`' {
                    if chars.get(i + 1) == Some(&'`') {
                        ident.push('`');
                        i += 2;
                        continue;
                    }
                    break;
                }
                ident.push(chars[i]);
                i += 1;
            }
            i += 1;
            tokens.push(Token::Quoted(ident));
        } else if is_word_char(c) {
            let start = i;
            while i < chars.len() && is_word_char(chars[i]) {
                i += 1;
            }
            tokens.push(Token::Word(chars[start..i].iter().collect()));
        } else {
            tokens.push(match c {
                '.' => Token::Dot,
                ',' => Token::Comma,
                '(' => Token::LParen,
                ')' => Token::RParen,
                _ => Token::Other,
            });
            i += 1;
        }
    }

    tokens
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

/// Returns the index just past the closing quote.
fn skip_string(chars: &[char], mut i: usize, quote: char) -> usize {
    while i < chars.len() {
        if chars[i] == '\\' {
            i += 2;
        } else if chars[i] == quote {
            if chars.get(i + 1) == Some(&quote) {
                i += 2;
            } else {
                return i + 1;
            }
        } else {
            i += 1;
        }
    }
    i
}

/// Words that end a table reference instead of naming an alias
const CLAUSE_KEYWORDS: &[&str] = &[
    "ADD", "CHANGE", "CROSS", "DELETE", "DROP", "DUPLICATE", "EXCEPT", "EXISTS", "FOR", "FORCE",
    "FROM", "FULL", "GROUP", "HAVING", "IF", "IGNORE", "INNER", "INSERT", "INTERSECT", "INTO",
    "JOIN", "LATERAL", "LEFT", "LIKE", "LIMIT", "LOCK", "MODIFY", "NATURAL", "NOT", "NOWAIT",
    "OFFSET", "ON", "ORDER", "OUTER", "PARTITION", "RENAME", "RETURNING", "RIGHT", "SELECT",
    "SET", "SKIP", "STRAIGHT_JOIN", "TABLESAMPLE", "TO", "UNION", "UPDATE", "USE", "USING",
    "VALUE", "VALUES", "WHERE", "WINDOW", "WITH",
];

/// Words that may sit between a table keyword and the name
const NAME_PREFIXES: &[&str] = &[
    "IF", "NOT", "EXISTS", "ONLY", "LATERAL", "TEMPORARY", "LOW_PRIORITY", "HIGH_PRIORITY",
    "DELAYED", "IGNORE", "QUICK", "INTO", "TABLE",
];

/// Words that can precede `(` without making it a function call
const GROUPING_KEYWORDS: &[&str] = &[
    "ALL", "AND", "ANY", "AS", "BY", "ELSE", "EXCEPT", "EXISTS", "FROM", "HAVING", "IN",
    "INTERSECT", "INTO", "IS", "JOIN", "LATERAL", "LIKE", "NOT", "ON", "OR", "RECURSIVE", "SELECT",
    "SET", "SOME", "TABLE", "THEN", "UNION", "USING", "VALUE", "VALUES", "WHEN", "WHERE", "WITH",
];

/// Never base tables
const NOT_TABLES: &[&str] = &["dual", "outfile", "dumpfile"];

#[derive(Debug, Clone)]
enum RefState {
    Idle,
    /// After a table keyword; `list` allows `a, b`
    ExpectTable { list: bool },
    /// Inside a possibly qualified name
    Name { list: bool, name: String, after_dot: bool },
    /// After a complete reference; an alias may follow
    AfterRef { list: bool, alias_allowed: bool },
    AfterAs { list: bool },
}

#[derive(Debug)]
struct Context {
    /// Function-call arguments never introduce tables
    expression: bool,
    state: RefState,
    /// Derived table opened right after a table keyword
    resume_list: Option<bool>,
}

impl Context {
    fn new(expression: bool) -> Self {
        Self {
            expression,
            state: RefState::Idle,
            resume_list: None,
        }
    }
}

fn contains(set: &[&str], keyword: &str) -> bool {
    set.contains(&keyword)
}

/// Table references found in one statement
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TableRefs {
    /// Lowercased base tables, in order of appearance
    pub tables: Vec<String>,
    /// A table keyword was followed by something other than a plain name
    pub unresolved: bool,
}

/// Lowercased base tables referenced by `query`, in order of appearance.
pub fn referenced_tables(query: &str) -> Vec<String> {
    scan_tables(query).tables
}

/// Scans `query` for table references and flags positions it could not read.
pub fn scan_tables(query: &str) -> TableRefs {
    let tokens = tokenize(query);
    let ctes = cte_scopes(&tokens);

    let mut found: Vec<String> = Vec::new();
    let mut unresolved = false;
    let mut record = |name: &str, at: usize| {
        let name = name.to_lowercase();
        if !ctes.iter().any(|scope| scope.hides(&name, at))
            && !NOT_TABLES.contains(&name.as_str())
            && !found.contains(&name)
        {
            found.push(name);
        }
    };

    let mut stack = vec![Context::new(false)];
    let mut prev: Option<&Token> = None;

    for (idx, token) in tokens.iter().enumerate() {
        let Some(ctx) = stack.last_mut() else { break };

        // Flush a finished name before looking at the token that ended it
        if let RefState::Name { list, name, after_dot } = &ctx.state {
            let continues = match token {
                Token::Dot => !after_dot,
                Token::Word(_) | Token::Quoted(_) => *after_dot,
                _ => false,
            };
            if !continues {
                let list = *list;
                record(name, idx);
                ctx.state = RefState::AfterRef { list, alias_allowed: true };
            }
        }

        let expecting = matches!(ctx.state, RefState::ExpectTable { .. });

        match token {
            Token::LParen => {
                let opens_subquery = tokens
                    .get(idx + 1)
                    .map_or(false, |t| t.is_keyword("SELECT") || t.is_keyword("WITH"));
                let function_call = match prev {
                    Some(Token::Word(w)) => !contains(GROUPING_KEYWORDS, &w.to_ascii_uppercase()),
                    _ => false,
                };

                let mut inner = Context::new((ctx.expression || function_call) && !opens_subquery);
                if let RefState::ExpectTable { list } = ctx.state {
                    inner.expression = false;
                    inner.resume_list = Some(list);
                    if !opens_subquery {
                        // `FROM (a, b)` and `JOIN (t)` group plain references
                        inner.state = RefState::ExpectTable { list: true };
                    }
                }
                ctx.state = RefState::Idle;
                stack.push(inner);
            }
            Token::RParen => {
                if expecting {
                    unresolved = true;
                }
                if stack.len() > 1 {
                    if let Some(closed) = stack.pop() {
                        if let (Some(list), Some(parent)) = (closed.resume_list, stack.last_mut()) {
                            parent.state = RefState::AfterRef { list, alias_allowed: true };
                        }
                    }
                }
            }
            _ if ctx.expression => {}
            Token::Dot => {
                if let RefState::Name { after_dot, .. } = &mut ctx.state {
                    *after_dot = true;
                }
            }
            Token::Comma => {
                ctx.state = match ctx.state {
                    RefState::AfterRef { list: true, .. } => RefState::ExpectTable { list: true },
                    _ => RefState::Idle,
                };
            }
            Token::Word(_) | Token::Quoted(_) => {
                let keyword = token.keyword();
                let is_clause = keyword
                    .as_deref()
                    .map_or(false, |k| contains(CLAUSE_KEYWORDS, k));

                ctx.state = match std::mem::replace(&mut ctx.state, RefState::Idle) {
                    RefState::Name { list, after_dot: true, .. } => RefState::Name {
                        list,
                        name: token.name().unwrap_or_default().to_string(),
                        after_dot: false,
                    },
                    RefState::ExpectTable { list }
                        if keyword.as_deref().map_or(false, |k| contains(NAME_PREFIXES, k)) =>
                    {
                        RefState::ExpectTable { list }
                    }
                    RefState::ExpectTable { list } if !is_clause => RefState::Name {
                        list,
                        name: token.name().unwrap_or_default().to_string(),
                        after_dot: false,
                    },
                    RefState::AfterRef { list, alias_allowed: true } if token.is_keyword("AS") => {
                        RefState::AfterAs { list }
                    }
                    RefState::AfterRef { list, alias_allowed: true } if !is_clause => {
                        RefState::AfterRef { list, alias_allowed: false }
                    }
                    RefState::AfterAs { list } => RefState::AfterRef { list, alias_allowed: false },
                    _ => table_keyword_state(keyword.as_deref(), prev, tokens.get(idx + 1)),
                };
            }
            Token::Other => ctx.state = RefState::Idle,
        }

        if expecting && !matches!(token, Token::LParen | Token::RParen) {
            let still_reading = stack
                .last()
                .map_or(false, |c| matches!(c.state, RefState::ExpectTable { .. } | RefState::Name { .. }));
            if !still_reading {
                unresolved = true;
            }
        }

        prev = Some(token);
    }

    for ctx in stack {
        match ctx.state {
            RefState::Name { name, .. } => record(&name, tokens.len()),
            RefState::ExpectTable { .. } => unresolved = true,
            _ => {}
        }
    }

    TableRefs {
        tables: found,
        unresolved,
    }
}

/// State entered when `keyword` introduces table names.
fn table_keyword_state(keyword: Option<&str>, prev: Option<&Token>, next: Option<&Token>) -> RefState {
    let prev_keyword = prev.and_then(Token::keyword);
    match keyword {
        Some("FROM" | "TABLE") => RefState::ExpectTable { list: true },
        Some("JOIN" | "STRAIGHT_JOIN" | "INTO") => RefState::ExpectTable { list: false },
        // `INSERT t ...` may omit INTO; `INSERT(...)` and `REPLACE(...)` are string functions
        Some("INSERT" | "REPLACE") if next != Some(&Token::LParen) => {
            RefState::ExpectTable { list: false }
        }
        // `ON DUPLICATE KEY UPDATE` and `FOR UPDATE` name columns, not tables
        Some("UPDATE") if !matches!(prev_keyword.as_deref(), Some("KEY" | "FOR")) => {
            RefState::ExpectTable { list: true }
        }
        _ => RefState::Idle,
    }
}

/// A `WITH` name and the token range where it shadows base tables
#[derive(Debug)]
struct CteScope {
    name: String,
    start: usize,
    /// Closing paren of the group that declared it, or the end of input
    end: usize,
}

impl CteScope {
    fn hides(&self, name: &str, at: usize) -> bool {
        self.name == name && (self.start..=self.end).contains(&at)
    }
}

/// Names declared by `WITH name [(cols)] AS (` and its comma continuations.
fn cte_scopes(tokens: &[Token]) -> Vec<CteScope> {
    let mut scopes = Vec::new();

    for (idx, token) in tokens.iter().enumerate() {
        let Some(name) = token.name() else { continue };
        let declares = idx
            .checked_sub(1)
            .and_then(|p| tokens.get(p))
            .map_or(false, |p| {
                p.is_keyword("WITH") || p.is_keyword("RECURSIVE") || *p == Token::Comma
            });
        if !declares {
            continue;
        }

        let mut next = idx + 1;
        if tokens.get(next) == Some(&Token::LParen) {
            match matching_paren(tokens, next) {
                Some(close) => next = close + 1,
                None => continue,
            }
        }
        let is_cte = tokens.get(next).map_or(false, |t| t.is_keyword("AS"))
            && tokens.get(next + 1) == Some(&Token::LParen);
        if is_cte {
            let end = enclosing_open(tokens, idx)
                .and_then(|open| matching_paren(tokens, open))
                .unwrap_or(tokens.len());
            scopes.push(CteScope {
                name: name.to_lowercase(),
                start: idx,
                end,
            });
        }
    }

    scopes
}

/// Index of the unmatched `(` that encloses `idx`, if any.
fn enclosing_open(tokens: &[Token], idx: usize) -> Option<usize> {
    let mut depth = 0usize;
    for j in (0..idx).rev() {
        match tokens[j] {
            Token::RParen => depth += 1,
            Token::LParen => {
                if depth == 0 {
                    return Some(j);
                }
                depth -= 1;
            }
            _ => {}
        }
    }
    None
}

fn matching_paren(tokens: &[Token], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (idx, token) in tokens.iter().enumerate().skip(open) {
        match token {
            Token::LParen => depth += 1,
            Token::RParen => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(idx);
                }
            }
            _ => {}
        }
    }
    None
}
