use super::expr::{CmpOp, Expr};
use super::file_safe;
use crate::context::TaskContext;
use crate::data_file::{DataFile, FileType, Tags};
use crate::error::SpinError;
use crate::io::jsonl::AtomicLineWriter;
use crate::record::{Record, field};
use anyhow::{Result, anyhow};
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashSet;

/// One `{field, op, value}` test. `op` is a comparison (`==`, `>=`, `in`,
/// ...) or `matches` for a regular expression.
#[derive(Clone, Debug, Deserialize)]
pub struct Clause {
    pub field: String,
    pub op: String,
    #[serde(default)]
    pub value: Value,
}

/// The two rule languages.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum RuleKind {
    Expression {
        #[serde(alias = "expression")]
        rule: String,
    },
    Clauses {
        clauses: Vec<Clause>,
    },
}

/// A named rule set; its matches go to a file of their own.
#[derive(Clone, Debug, Deserialize)]
pub struct FilterRule {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub tags: Tags,
    #[serde(flatten)]
    pub kind: RuleKind,
}

#[derive(Clone, Debug)]
enum ClauseTest {
    Compare(CmpOp, Value),
    Matches(Regex),
}

#[derive(Clone, Debug)]
enum Compiled {
    Expr(Expr),
    Clauses(Vec<(String, ClauseTest)>),
    /// A rule that failed to compile matches nothing.
    Invalid(String),
}

impl Compiled {
    fn new(kind: &RuleKind) -> Self {
        match kind {
            RuleKind::Expression { rule } => match Expr::parse(rule) {
                Ok(expr) => Self::Expr(expr),
                Err(e) => Self::Invalid(format!("{e:#}")),
            },
            RuleKind::Clauses { clauses } => {
                let mut tests = Vec::with_capacity(clauses.len());
                for c in clauses {
                    let test = match c.op.trim().to_ascii_lowercase().as_str() {
                        "matches" | "regex" | "~" => {
                            let pattern = c.value.as_str().unwrap_or_default();
                            match Regex::new(pattern) {
                                Ok(re) => ClauseTest::Matches(re),
                                Err(e) => return Self::Invalid(format!("bad pattern for `{}`: {e}", c.field)),
                            }
                        }
                        op => match CmpOp::parse(op) {
                            Some(op) => ClauseTest::Compare(op, c.value.clone()),
                            None => return Self::Invalid(format!("unsupported operator `{}`", c.op)),
                        },
                    };
                    tests.push((c.field.clone(), test));
                }
                Self::Clauses(tests)
            }
        }
    }

    fn matches(&self, record: &Record) -> Result<bool> {
        match self {
            Self::Expr(expr) => expr.matches(record),
            Self::Clauses(tests) => {
                for (name, test) in tests {
                    let value = field(record, name).unwrap_or(&Value::Null);
                    let ok = match test {
                        ClauseTest::Compare(op, want) => op.apply(value, want)?,
                        ClauseTest::Matches(re) => value.as_str().is_some_and(|s| re.is_match(s)),
                    };
                    if !ok {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Self::Invalid(reason) => Err(anyhow!("invalid rule: {reason}")),
        }
    }
}

#[derive(Deserialize)]
struct FilterArgs {
    #[serde(default, alias = "rules")]
    filter_rules: Vec<FilterRule>,
}

/// Route records into one output file per matching rule.
///
/// A record may land in several files. Rules that fail to compile or
/// evaluate are logged and match nothing. Index files pass through.
#[derive(Clone, Debug)]
pub struct Filter {
    rules: Vec<(FilterRule, Compiled)>,
}

impl Filter {
    /// # Errors
    ///
    /// Returns [`SpinError::Configuration`] if the arguments are not a rule list.
    pub fn from_args(args: &Map<String, Value>) -> Result<Self> {
        let parsed: FilterArgs = serde_json::from_value(Value::Object(args.clone()))
            .map_err(|e| SpinError::Configuration(format!("invalid filter rules: {e}")))?;
        Ok(Self::new(parsed.filter_rules))
    }

    #[must_use]
    pub fn new(rules: Vec<FilterRule>) -> Self {
        let rules = rules
            .into_iter()
            .map(|r| {
                let compiled = Compiled::new(&r.kind);
                if let Compiled::Invalid(reason) = &compiled {
                    tracing::error!(rule = ?r.name, tags = ?r.tags, %reason, "filter rule will match nothing");
                }
                (r, compiled)
            })
            .collect();
        Self { rules }
    }

    fn labels(&self) -> Vec<String> {
        let mut used = HashSet::new();
        self.rules
            .iter()
            .enumerate()
            .map(|(i, (rule, _))| {
                let base = match &rule.name {
                    Some(name) => file_safe(name),
                    None if !rule.tags.is_empty() => {
                        file_safe(&rule.tags.values().cloned().collect::<Vec<_>>().join("_"))
                    }
                    None => "default".to_string(),
                };
                if used.insert(base.clone()) {
                    base
                } else {
                    format!("{base}_{i}")
                }
            })
            .collect()
    }

    pub(crate) fn process(&self, file: &DataFile, ctx: &mut TaskContext<'_>) -> Result<Vec<DataFile>> {
        if file.is_index() {
            return Ok(vec![file.clone()]);
        }
        let labels = self.labels();
        let mut writers = labels
            .iter()
            .map(|label| AtomicLineWriter::create(ctx.temp_path(&format!("{}-filter-{label}.jsonl", file.name()))))
            .collect::<Result<Vec<_>>>()?;
        let mut failures = vec![0usize; self.rules.len()];

        for (record, line) in file.readlines()?.skip_malformed() {
            for (i, (_, compiled)) in self.rules.iter().enumerate() {
                match compiled.matches(&record) {
                    Ok(true) => writers[i].write_line(&line)?,
                    Ok(false) => {}
                    Err(err) => {
                        failures[i] += 1;
                        tracing::debug!(rule = %labels[i], error = %err, "rule evaluation failed");
                    }
                }
            }
        }

        let mut out = Vec::with_capacity(writers.len());
        for (i, writer) in writers.into_iter().enumerate() {
            if failures[i] > 0 {
                tracing::warn!(rule = %labels[i], records = failures[i], file = %file.path().display(), "rule errored, treated as no match");
            }
            let matched = writer.lines();
            let path = writer.commit()?;
            tracing::debug!(rule = %labels[i], matched, "filter output written");
            let mut tags = file.tags().clone();
            tags.extend(self.rules[i].0.tags.clone());
            out.push(ctx.create_data_file(path, FileType::Table, tags));
        }
        Ok(out)
    }
}
