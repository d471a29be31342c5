use std::fmt;

/// Identity of one cached logical query, e.g. `notifications?user_id=7`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey {
    scope: String,
    params: Vec<(String, String)>,
}

impl QueryKey {
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            params: Vec::new(),
        }
    }

    /// Add a parameter. Parameter order does not affect identity.
    pub fn with(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.params.push((name.into(), value.to_string()));
        self.params.sort();
        self
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.scope)?;
        for (i, (name, value)) in self.params.iter().enumerate() {
            let sep = if i == 0 { '?' } else { '&' };
            write!(f, "{}{}={}", sep, name, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_order_does_not_matter() {
        let a = QueryKey::new("requests").with("status", "pending").with("user_id", 4);
        let b = QueryKey::new("requests").with("user_id", 4).with("status", "pending");
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "requests?status=pending&user_id=4");
    }
}
