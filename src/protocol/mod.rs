//! EC wire commands.
//!
//! Every payload is one S-expression whose head atom names the command:
//!
//! | Command                                  | Direction            |
//! |------------------------------------------|----------------------|
//! | `(add name value)`                       | Producer → consumer  |
//! | `(update name value)`                    | either               |
//! | `(remove name)`                          | Producer → consumer  |
//! | `(item_count N)`                         | Producer → consumer  |
//! | `(share response_topic lease filter)`    | Consumer → producer  |
//! | `(sync response_topic)`                  | Producer → broadcast |
//!
//! Scalars are atoms; text that would read back as a number or boolean is
//! quoted. A map value is written as `((key value) ...)`. A filter is `*` or a
//! list of path prefixes.

pub mod sexp;

use std::collections::BTreeMap;

use crate::ec::{Filter, Scalar, Value};
use crate::{Error, Result};

pub use sexp::Expr;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Add { path: String, value: Value },
    Update { path: String, value: Value },
    Remove { path: String },
    ItemCount(usize),
    Share {
        response_topic: String,
        lease_seconds: u64,
        filter: Filter,
    },
    Sync { response_topic: String },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Add { .. } => "add",
            Command::Update { .. } => "update",
            Command::Remove { .. } => "remove",
            Command::ItemCount(_) => "item_count",
            Command::Share { .. } => "share",
            Command::Sync { .. } => "sync",
        }
    }

    pub fn encode(&self) -> String {
        let mut items = vec![Expr::Atom(self.name().to_string())];
        match self {
            Command::Add { path, value } | Command::Update { path, value } => {
                items.push(Expr::text(path));
                items.push(value_expr(value));
            }
            Command::Remove { path } => items.push(Expr::text(path)),
            Command::ItemCount(count) => items.push(Expr::Atom(count.to_string())),
            Command::Share {
                response_topic,
                lease_seconds,
                filter,
            } => {
                items.push(Expr::text(response_topic));
                items.push(Expr::Atom(lease_seconds.to_string()));
                items.push(filter_expr(filter));
            }
            Command::Sync { response_topic } => items.push(Expr::text(response_topic)),
        }
        Expr::List(items).to_string()
    }

    /// # Errors
    ///
    /// `Error::Codec` for malformed payloads, unknown commands or wrong arity.
    pub fn decode(payload: &str) -> Result<Self> {
        let expr = sexp::parse(payload)?;
        let items = expr
            .as_list()
            .ok_or_else(|| codec_error("command must be a list", payload))?;
        let (head, args) = items
            .split_first()
            .ok_or_else(|| codec_error("empty command", payload))?;
        let name = match head {
            Expr::Atom(name) => name.as_str(),
            _ => return Err(codec_error("command name must be an atom", payload)),
        };

        let command = match (name, args) {
            ("add", [path, value]) => Command::Add {
                path: text_arg(path, payload)?,
                value: parse_value(value, payload)?,
            },
            ("update", [path, value]) => Command::Update {
                path: text_arg(path, payload)?,
                value: parse_value(value, payload)?,
            },
            ("remove", [path]) => Command::Remove {
                path: text_arg(path, payload)?,
            },
            ("item_count", [count]) => Command::ItemCount(number_arg(count, payload)?),
            ("share", [topic, lease, filter]) => Command::Share {
                response_topic: text_arg(topic, payload)?,
                lease_seconds: number_arg(lease, payload)?,
                filter: parse_filter(filter, payload)?,
            },
            ("sync", [topic]) => Command::Sync {
                response_topic: text_arg(topic, payload)?,
            },
            _ => return Err(codec_error("unknown command or wrong arity", payload)),
        };
        Ok(command)
    }
}

fn codec_error(reason: &str, payload: &str) -> Error {
    Error::Codec(format!("{reason}: {payload:?}"))
}

fn scalar_expr(scalar: &Scalar) -> Expr {
    match scalar {
        Scalar::Str(text) => {
            if Scalar::from_atom(text) == *scalar {
                Expr::text(text)
            } else {
                Expr::Quoted(text.clone())
            }
        }
        other => Expr::Atom(other.to_string()),
    }
}

fn value_expr(value: &Value) -> Expr {
    match value {
        Value::Scalar(scalar) => scalar_expr(scalar),
        Value::Map(map) => Expr::List(
            map.iter()
                .map(|(key, scalar)| Expr::List(vec![Expr::text(key), scalar_expr(scalar)]))
                .collect(),
        ),
    }
}

fn filter_expr(filter: &Filter) -> Expr {
    match filter {
        Filter::All => Expr::Atom("*".to_string()),
        Filter::Prefixes(prefixes) => {
            Expr::List(prefixes.iter().map(|prefix| Expr::text(prefix)).collect())
        }
    }
}

fn parse_scalar(expr: &Expr, payload: &str) -> Result<Scalar> {
    match expr {
        Expr::Atom(text) => Ok(Scalar::from_atom(text)),
        Expr::Quoted(text) => Ok(Scalar::Str(text.clone())),
        Expr::List(_) => Err(codec_error("expected a scalar", payload)),
    }
}

fn parse_value(expr: &Expr, payload: &str) -> Result<Value> {
    let Expr::List(pairs) = expr else {
        return Ok(Value::Scalar(parse_scalar(expr, payload)?));
    };
    let mut map = BTreeMap::new();
    for pair in pairs {
        match pair.as_list() {
            Some([key, value]) => {
                map.insert(text_arg(key, payload)?, parse_scalar(value, payload)?);
            }
            _ => return Err(codec_error("map entries must be (key value)", payload)),
        }
    }
    Ok(Value::Map(map))
}

fn parse_filter(expr: &Expr, payload: &str) -> Result<Filter> {
    match expr {
        Expr::Atom(text) if text == "*" => Ok(Filter::All),
        Expr::List(items) => items
            .iter()
            .map(|item| text_arg(item, payload))
            .collect::<Result<Vec<_>>>()
            .map(Filter::Prefixes),
        _ => Err(codec_error("filter must be * or a list", payload)),
    }
}

fn text_arg(expr: &Expr, payload: &str) -> Result<String> {
    expr.as_text()
        .map(str::to_string)
        .ok_or_else(|| codec_error("expected text", payload))
}

fn number_arg<T: std::str::FromStr>(expr: &Expr, payload: &str) -> Result<T> {
    match expr {
        Expr::Atom(text) => text
            .parse()
            .map_err(|_| codec_error("expected a non-negative integer", payload)),
        _ => Err(codec_error("expected a non-negative integer", payload)),
    }
}
