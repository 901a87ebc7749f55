//! Data-name modifiers.
//!
//! A dependency is a base name optionally wrapped with a semantic marker
//! that alters how the planner and executor treat it. Matching across the
//! engine is always by [`Dep::base`]; the variant only controls behavior.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A (possibly modified) data name appearing in an operation's needs or
/// provides.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dep {
    /// An ordinary required dependency.
    Plain(String),

    /// A dependency the operation can run without; absent values are
    /// omitted from the body's inputs rather than passed as a sentinel.
    Optional(String),

    /// A dependency passed to the body under a different key.
    Keyword {
        /// The data name in the solution.
        name: String,
        /// The key the body sees.
        keyword: String,
        /// Whether absence still lets the operation run.
        optional: bool,
    },

    /// An ordering-only pseudo-name for an unobservable state mutation.
    /// Never carries a value and is never passed to a body.
    Sideffect(String),

    /// A dependency that must exist in the solution but is not passed into
    /// the body.
    Implicit(String),

    /// Provides-only: after execution the value at `src` is also published
    /// under `dst`.
    Alias {
        /// The provide whose value is copied.
        src: String,
        /// The additional name the value is exposed under.
        dst: String,
    },
}

impl Dep {
    /// The base data name this dependency contributes or consumes.
    ///
    /// For aliases this is the *destination* name, since that is the data
    /// node the operation adds to the graph.
    #[must_use]
    pub fn base(&self) -> &str {
        match self {
            Dep::Plain(n) | Dep::Optional(n) | Dep::Sideffect(n) | Dep::Implicit(n) => n,
            Dep::Keyword { name, .. } => name,
            Dep::Alias { dst, .. } => dst,
        }
    }

    /// The key under which the value is handed to the body.
    #[must_use]
    pub fn keyword(&self) -> &str {
        match self {
            Dep::Keyword { keyword, .. } => keyword,
            _ => self.base(),
        }
    }

    /// True when absence of this dependency does not block the operation.
    #[must_use]
    pub fn is_optional(&self) -> bool {
        matches!(
            self,
            Dep::Optional(_) | Dep::Keyword { optional: true, .. }
        )
    }

    /// True for ordering-only pseudo-names.
    #[must_use]
    pub fn is_sideffect(&self) -> bool {
        matches!(self, Dep::Sideffect(_))
    }

    /// True for dependencies known to exist but never passed to the body.
    #[must_use]
    pub fn is_implicit(&self) -> bool {
        matches!(self, Dep::Implicit(_))
    }

    /// True for alias provides.
    #[must_use]
    pub fn is_alias(&self) -> bool {
        matches!(self, Dep::Alias { .. })
    }

    /// True when the value is visible to the operation body.
    ///
    /// Sideffects and implicits participate in planning and ordering but
    /// never appear in the mapping handed to the body.
    #[must_use]
    pub fn is_body_visible(&self) -> bool {
        !self.is_sideffect() && !self.is_implicit()
    }
}

impl fmt::Display for Dep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dep::Plain(n) => write!(f, "{n}"),
            Dep::Optional(n) => write!(f, "{n}(?)"),
            Dep::Keyword {
                name,
                keyword,
                optional,
            } => {
                if *optional {
                    write!(f, "{name}(?>{keyword})")
                } else {
                    write!(f, "{name}(>{keyword})")
                }
            }
            Dep::Sideffect(n) => write!(f, "sideffect({n})"),
            Dep::Implicit(n) => write!(f, "{n}(implicit)"),
            Dep::Alias { src, dst } => write!(f, "{src}(as {dst})"),
        }
    }
}

impl From<&str> for Dep {
    fn from(name: &str) -> Self {
        Dep::Plain(name.to_string())
    }
}

impl From<String> for Dep {
    fn from(name: String) -> Self {
        Dep::Plain(name)
    }
}

/// Marks a dependency as optional.
#[must_use]
pub fn optional(name: impl Into<String>) -> Dep {
    Dep::Optional(name.into())
}

/// Renames a dependency for the body: the solution value at `name` is
/// passed under `keyword`.
#[must_use]
pub fn keyword(name: impl Into<String>, kw: impl Into<String>) -> Dep {
    Dep::Keyword {
        name: name.into(),
        keyword: kw.into(),
        optional: false,
    }
}

/// An optional dependency passed to the body under a different key.
#[must_use]
pub fn optional_keyword(name: impl Into<String>, kw: impl Into<String>) -> Dep {
    Dep::Keyword {
        name: name.into(),
        keyword: kw.into(),
        optional: true,
    }
}

/// Declares an ordering-only sideffect token.
#[must_use]
pub fn sideffect(token: impl Into<String>) -> Dep {
    Dep::Sideffect(token.into())
}

/// Declares a dependency that must exist in the solution but is not passed
/// into the body.
#[must_use]
pub fn implicit(name: impl Into<String>) -> Dep {
    Dep::Implicit(name.into())
}

/// Declares that the value provided at `src` is also exposed under `dst`.
#[must_use]
pub fn alias(src: impl Into<String>, dst: impl Into<String>) -> Dep {
    Dep::Alias {
        src: src.into(),
        dst: dst.into(),
    }
}
