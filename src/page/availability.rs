//! URL / selector based availability.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::Page;
use crate::config::Availability;
use crate::ports::AvailabilityChecker;

/// Available when the page URL matches one of `matchPatterns` (any URL if the
/// list is empty) and every entry of `selectors` matches at least one element.
pub struct PageAvailability {
    page: Arc<dyn Page>,
    rules: Availability,
}

impl PageAvailability {
    pub fn new(page: Arc<dyn Page>, rules: Availability) -> Self {
        Self { page, rules }
    }
}

#[async_trait]
impl AvailabilityChecker for PageAvailability {
    async fn is_available(&self) -> anyhow::Result<bool> {
        let url = self.page.url();
        let url_ok = self.rules.match_patterns.is_empty()
            || self
                .rules
                .match_patterns
                .iter()
                .any(|pattern| glob_match(pattern, &url));
        if !url_ok {
            debug!(target: "pagetrigger::availability", %url, "URL does not match any pattern");
            return Ok(false);
        }

        let missing = self
            .rules
            .selectors
            .iter()
            .find(|selector| self.page.query_all(selector).is_empty());
        if let Some(selector) = missing {
            debug!(target: "pagetrigger::availability", %selector, "Required selector not present");
            return Ok(false);
        }
        Ok(true)
    }
}

/// `*` matches any (possibly empty) run of characters; everything else is literal.
fn glob_match(pattern: &str, text: &str) -> bool {
    let mut parts = pattern.split('*');
    let Some(first) = parts.next() else {
        return text.is_empty();
    };
    let Some(mut rest) = text.strip_prefix(first) else {
        return false;
    };

    let tail: Vec<&str> = parts.collect();
    let Some((last, middle)) = tail.split_last() else {
        // No wildcard at all.
        return rest.is_empty();
    };
    for part in middle {
        match rest.find(part) {
            Some(pos) => rest = &rest[pos + part.len()..],
            None => return false,
        }
    }
    rest.len() >= last.len() && rest.ends_with(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{ElementSeed, VirtualPage};

    #[test]
    fn test_glob_match() {
        assert!(glob_match("https://*.example.com/*", "https://shop.example.com/cart"));
        assert!(glob_match("*", ""));
        assert!(glob_match("https://example.com/", "https://example.com/"));
        assert!(!glob_match("https://example.com/", "https://example.com/x"));
        assert!(!glob_match("https://*.example.com/*", "https://example.org/"));
        assert!(glob_match("*cart*pay", "/cart/then/pay"));
        assert!(!glob_match("a*b*a", "ab"));
    }

    #[tokio::test]
    async fn test_availability_rules() {
        let page = Arc::new(VirtualPage::with_elements(
            "https://shop.example.com/cart",
            &[ElementSeed::new("div").with_id("cart")],
        ));
        let check = |patterns: &[&str], selectors: &[&str]| {
            PageAvailability::new(
                page.clone(),
                Availability {
                    match_patterns: patterns.iter().map(|s| s.to_string()).collect(),
                    selectors: selectors.iter().map(|s| s.to_string()).collect(),
                },
            )
        };

        assert!(check(&[], &[]).is_available().await.unwrap());
        assert!(
            check(&["https://shop.example.com/*"], &["#cart"])
                .is_available()
                .await
                .unwrap()
        );
        assert!(
            !check(&["https://other.example.com/*"], &[])
                .is_available()
                .await
                .unwrap()
        );
        assert!(!check(&[], &["#missing"]).is_available().await.unwrap());
    }
}
