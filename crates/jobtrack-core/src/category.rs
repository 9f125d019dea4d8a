//! Keyword-based category classifier with fixed priority order.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Category {
    #[serde(rename = "Quant")]
    Quant,
    #[serde(rename = "Structuring")]
    Structuring,
    #[serde(rename = "Sales & Trading")]
    SalesTrading,
    #[serde(rename = "Research")]
    Research,
    #[serde(rename = "Investment Banking")]
    InvestmentBanking,
    #[serde(rename = "Technology")]
    Technology,
    #[serde(rename = "Other")]
    Other,
}

/// Test order. The first category with any keyword hit wins.
pub const PRIORITY: [Category; 6] = [
    Category::Quant,
    Category::Structuring,
    Category::SalesTrading,
    Category::Research,
    Category::InvestmentBanking,
    Category::Technology,
];

const QUANT: &[&str] = &[
    "quant",
    "quantitative",
    "quantitative research",
    "quantitative trading",
    "quantitative analytics",
    "quantitative strategies",
    "quantitative modeling",
    "risk analytics",
    "model validation",
    "strat",
    "quantitative developer",
];

const STRUCTURING: &[&str] = &[
    "structuring",
    "structured products",
    "structured finance",
    "securitization",
    "abs",
    "mbs",
    "cdo",
    "clo",
    "exotic derivatives",
    "structured credit",
    "structured solutions",
];

const SALES_TRADING: &[&str] = &[
    "sales",
    "trading",
    "trader",
    "sales & trading",
    "s&t",
    "equities",
    "equity",
    "fixed income",
    "ficc",
    "commodities",
    "foreign exchange",
    "fx",
    "forex",
    "macro",
    "credit trading",
    "rates",
    "currencies",
    "electronic trading",
    "market making",
    "flow trading",
    "derivatives",
    "options",
    "futures",
];

const RESEARCH: &[&str] = &[
    "research",
    "equity research",
    "credit research",
    "analyst coverage",
    "sector analyst",
    "research associate",
];

// Entries with padding spaces are matched against "<title> <description>",
// so "ib " only hits as a whole token followed by more text.
const INVESTMENT_BANKING: &[&str] = &[
    "investment banking",
    "ibd",
    "ib ",
    " ib,",
    "mergers",
    "acquisitions",
    "m&a",
    "coverage",
    "corporate finance",
    "leveraged finance",
    "private equity",
    "pe ",
    "growth equity",
    "venture capital",
    "real estate",
    "infrastructure",
    "energy",
    "natural resources",
    "healthcare banking",
    "financial institutions group",
    "fig",
    "technology banking",
    "tmt",
    "industrials",
    "consumer retail",
    "capital markets",
    "ecm",
    "dcm",
    "equity capital markets",
    "debt capital markets",
    "strategic partners",
];

const TECHNOLOGY: &[&str] = &[
    "technology",
    "software",
    "developer",
    "engineer",
    "engineering",
    "data science",
    "data scientist",
    "machine learning",
    "ai ",
    "artificial intelligence",
    "cloud",
    "devops",
    "cyber",
    "information security",
    "it ",
    "systems",
];

impl Category {
    pub const ALL: [Category; 7] = [
        Category::Quant,
        Category::Structuring,
        Category::SalesTrading,
        Category::Research,
        Category::InvestmentBanking,
        Category::Technology,
        Category::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Quant => "Quant",
            Category::Structuring => "Structuring",
            Category::SalesTrading => "Sales & Trading",
            Category::Research => "Research",
            Category::InvestmentBanking => "Investment Banking",
            Category::Technology => "Technology",
            Category::Other => "Other",
        }
    }

    pub fn keywords(&self) -> &'static [&'static str] {
        match self {
            Category::Quant => QUANT,
            Category::Structuring => STRUCTURING,
            Category::SalesTrading => SALES_TRADING,
            Category::Research => RESEARCH,
            Category::InvestmentBanking => INVESTMENT_BANKING,
            Category::Technology => TECHNOLOGY,
            Category::Other => &[],
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown category `{0}`")]
pub struct CategoryParseError(pub String);

impl FromStr for Category {
    type Err = CategoryParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| CategoryParseError(s.to_string()))
    }
}

/// Classify a posting by keyword membership. Blank titles are always `Other`.
pub fn classify(title: &str, description: &str) -> Category {
    if title.trim().is_empty() {
        return Category::Other;
    }
    let combined = format!("{} {}", title.to_lowercase(), description.to_lowercase());
    PRIORITY
        .into_iter()
        .find(|category| category.keywords().iter().any(|kw| combined.contains(kw)))
        .unwrap_or(Category::Other)
}
