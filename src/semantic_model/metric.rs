use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sqlparser::ast::{
    DuplicateTreatment, Expr, FunctionArg, FunctionArgExpr, FunctionArguments,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::Token;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MetricExprError {
    #[error("Metric expression is not a single aggregate call: {0}")]
    NotAnAggregate(String),

    #[error("Unsupported aggregation: {0}")]
    UnsupportedAggregation(String),

    #[error("Unsupported aggregate argument in: {0}")]
    UnsupportedArgument(String),

    #[error("SQL parsing error: {0}")]
    SqlParseError(String),
}

/// Closed set of aggregation operators a metric may use.
///
/// Free-form expression text is rejected at the boundary; only
/// `op(column)` survives into storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    Sum,
    Avg,
    Median,
    Count,
    CountDistinct,
    Min,
    Max,
}

impl Aggregation {
    fn keyword(&self) -> &'static str {
        match self {
            Aggregation::Sum => "sum",
            Aggregation::Avg => "avg",
            Aggregation::Median => "median",
            Aggregation::Count => "count",
            Aggregation::CountDistinct => "count",
            Aggregation::Min => "min",
            Aggregation::Max => "max",
        }
    }
}

/// An aggregation operator applied to one column reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricExpr {
    pub agg: Aggregation,
    pub column: String,
}

impl MetricExpr {
    pub fn new(agg: Aggregation, column: impl Into<String>) -> Self {
        Self {
            agg,
            column: column.into(),
        }
    }

    /// Render the expression as the SQL fragment the compiled query uses.
    pub fn render(&self) -> String {
        match self.agg {
            Aggregation::Sum => format!("SUM({})", self.column),
            Aggregation::Avg => format!("AVG({})", self.column),
            Aggregation::Median => format!("MEDIAN({})", self.column),
            Aggregation::Count => format!("COUNT({})", self.column),
            Aggregation::CountDistinct => format!("COUNT(DISTINCT {})", self.column),
            Aggregation::Min => format!("MIN({})", self.column),
            Aggregation::Max => format!("MAX({})", self.column),
        }
    }
}

impl fmt::Display for MetricExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.agg {
            Aggregation::CountDistinct => write!(f, "count(distinct {})", self.column),
            agg => write!(f, "{}({})", agg.keyword(), self.column),
        }
    }
}

impl FromStr for MetricExpr {
    type Err = MetricExprError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let dialect = GenericDialect {};
        let mut parser = Parser::new(&dialect)
            .try_with_sql(s)
            .map_err(|e| MetricExprError::SqlParseError(e.to_string()))?;
        let expr = parser
            .parse_expr()
            .map_err(|e| MetricExprError::SqlParseError(e.to_string()))?;
        if parser.peek_token().token != Token::EOF {
            // Trailing input means the text was more than one expression.
            return Err(MetricExprError::NotAnAggregate(s.to_string()));
        }

        let func = match expr {
            Expr::Function(func) => func,
            _ => return Err(MetricExprError::NotAnAggregate(s.to_string())),
        };

        if func.over.is_some() || func.filter.is_some() || !func.within_group.is_empty() {
            return Err(MetricExprError::NotAnAggregate(s.to_string()));
        }

        let name = func
            .name
            .0
            .first()
            .map(|ident| ident.value.to_lowercase())
            .unwrap_or_default();

        let list = match &func.args {
            FunctionArguments::List(list) => list,
            _ => return Err(MetricExprError::UnsupportedArgument(s.to_string())),
        };
        if list.args.len() != 1 || !list.clauses.is_empty() {
            return Err(MetricExprError::UnsupportedArgument(s.to_string()));
        }
        let distinct = matches!(list.duplicate_treatment, Some(DuplicateTreatment::Distinct));

        let column = match &list.args[0] {
            FunctionArg::Unnamed(FunctionArgExpr::Expr(Expr::Identifier(ident))) => {
                ident.value.clone()
            }
            FunctionArg::Unnamed(FunctionArgExpr::Expr(Expr::CompoundIdentifier(parts))) => parts
                .iter()
                .map(|ident| ident.value.as_str())
                .collect::<Vec<_>>()
                .join("."),
            FunctionArg::Unnamed(FunctionArgExpr::Wildcard) => "*".to_string(),
            _ => return Err(MetricExprError::UnsupportedArgument(s.to_string())),
        };

        let agg = match (name.as_str(), distinct) {
            ("sum", false) => Aggregation::Sum,
            ("avg", false) => Aggregation::Avg,
            ("median", false) => Aggregation::Median,
            ("count", false) => Aggregation::Count,
            ("count", true) => Aggregation::CountDistinct,
            ("min", false) => Aggregation::Min,
            ("max", false) => Aggregation::Max,
            _ => return Err(MetricExprError::UnsupportedAggregation(name)),
        };

        if column == "*" && agg != Aggregation::Count {
            return Err(MetricExprError::UnsupportedArgument(s.to_string()));
        }

        Ok(MetricExpr { agg, column })
    }
}

// Wire format stays the expression string ("sum(amount)"); the structured
// form is what gets stored and compiled.
impl Serialize for MetricExpr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MetricExpr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Display formatting hint for the client; opaque to query compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricFormat {
    #[default]
    Number,
    Currency,
    Percent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDef {
    pub key: String,
    pub label: String,
    pub sql: MetricExpr,
    #[serde(default)]
    pub format: MetricFormat,
}

impl MetricDef {
    /// `SUM(amount) AS revenue` style select item.
    pub fn render_with_alias(&self) -> String {
        format!("{} AS {}", self.sql.render(), self.key)
    }
}
