// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tag filtering and run planning
//!
//! A plan is the declaration-ordered subset of directives admitted by the
//! tag filter. Nothing is ever reordered.

use std::collections::BTreeSet;

use crate::directive::Directive;

/// Tag inclusion/exclusion filter; exclusion always wins
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagFilter {
    /// When non-empty, a directive needs at least one of these tags
    pub include: BTreeSet<String>,
    /// A directive with any of these tags is omitted
    pub exclude: BTreeSet<String>,
}

impl TagFilter {
    /// Build a filter from include and exclude lists
    pub fn new<I, E>(include: I, exclude: E) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
        E: IntoIterator,
        E::Item: Into<String>,
    {
        Self {
            include: include.into_iter().map(Into::into).collect(),
            exclude: exclude.into_iter().map(Into::into).collect(),
        }
    }

    /// Build a filter from CLI values, splitting comma-separated lists
    pub fn from_args(include: &[String], exclude: &[String]) -> Self {
        let split = |values: &[String]| -> BTreeSet<String> {
            values
                .iter()
                .flat_map(|value| value.split(','))
                .map(str::trim)
                .filter(|tag| !tag.is_empty())
                .map(str::to_string)
                .collect()
        };
        Self {
            include: split(include),
            exclude: split(exclude),
        }
    }

    /// Whether a directive with these tags runs
    pub fn admits(&self, tags: &BTreeSet<String>) -> bool {
        if !self.exclude.is_disjoint(tags) {
            return false;
        }
        self.include.is_empty() || !self.include.is_disjoint(tags)
    }
}

/// The runnable subset of a directive list
#[derive(Debug, Clone)]
pub struct Plan<'a> {
    runnable: Vec<&'a Directive>,
    omitted: Vec<&'a Directive>,
}

impl<'a> Plan<'a> {
    /// Filter directives by tag, preserving declaration order
    pub fn build(directives: &'a [Directive], filter: &TagFilter) -> Self {
        let (runnable, omitted): (Vec<&Directive>, Vec<&Directive>) = directives
            .iter()
            .partition(|directive| filter.admits(&directive.tags));
        Self { runnable, omitted }
    }

    /// Directives that will run, in order
    pub fn runnable(&self) -> &[&'a Directive] {
        &self.runnable
    }

    /// Directives the filter left out, in order
    pub fn omitted(&self) -> &[&'a Directive] {
        &self.omitted
    }

    /// Number of runnable directives
    pub fn len(&self) -> usize {
        self.runnable.len()
    }

    /// Whether nothing will run
    pub fn is_empty(&self) -> bool {
        self.runnable.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directive::Body;

    fn directives() -> Vec<Directive> {
        vec![
            Directive::new("create-user", Body::command("true")).with_tags(["users"]),
            Directive::new("sshd-config", Body::command("true")).with_tags(["ssh", "security"]),
            Directive::new("ufw-rules", Body::command("true")).with_tags(["firewall", "security"]),
            Directive::new("swap", Body::command("true")),
            Directive::new("docker", Body::command("true")).with_tags(["docker"]),
        ]
    }

    fn ids(plan: &Plan<'_>) -> Vec<String> {
        plan.runnable().iter().map(|d| d.id.clone()).collect()
    }

    #[test]
    fn test_empty_filter_runs_everything_in_order() {
        let directives = directives();
        let plan = Plan::build(&directives, &TagFilter::default());
        assert_eq!(
            ids(&plan),
            vec!["create-user", "sshd-config", "ufw-rules", "swap", "docker"]
        );
        assert!(plan.omitted().is_empty());
    }

    #[test]
    fn test_include_filter() {
        let directives = directives();
        let plan = Plan::build(&directives, &TagFilter::new(["security"], Vec::<String>::new()));
        assert_eq!(ids(&plan), vec!["sshd-config", "ufw-rules"]);
        assert_eq!(plan.omitted().len(), 3);
    }

    #[test]
    fn test_exclude_wins_over_include() {
        let directives = directives();
        let plan = Plan::build(&directives, &TagFilter::new(["security"], ["firewall"]));
        assert_eq!(ids(&plan), vec!["sshd-config"]);
    }

    #[test]
    fn test_exclude_only_keeps_untagged() {
        let directives = directives();
        let plan = Plan::build(&directives, &TagFilter::new(Vec::<String>::new(), ["security"]));
        assert_eq!(ids(&plan), vec!["create-user", "swap", "docker"]);
    }

    #[test]
    fn test_untagged_directive_excluded_by_include() {
        let directives = directives();
        let plan = Plan::build(&directives, &TagFilter::new(["docker"], Vec::<String>::new()));
        assert_eq!(ids(&plan), vec!["docker"]);
    }

    #[test]
    fn test_from_args_splits_commas() {
        let filter = TagFilter::from_args(
            &["ssh,firewall".to_string(), " users ".to_string()],
            &["docker,".to_string()],
        );
        assert_eq!(filter, TagFilter::new(["firewall", "ssh", "users"], ["docker"]));
    }

    #[test]
    fn test_admits_matches_set_definition() {
        // D runs iff tags ∩ exclude = ∅ and (include = ∅ or tags ∩ include ≠ ∅)
        let tag_sets: Vec<BTreeSet<String>> = vec![
            BTreeSet::new(),
            ["a"].iter().map(|s| s.to_string()).collect(),
            ["b"].iter().map(|s| s.to_string()).collect(),
            ["a", "b"].iter().map(|s| s.to_string()).collect(),
            ["c"].iter().map(|s| s.to_string()).collect(),
        ];

        for include in &tag_sets {
            for exclude in &tag_sets {
                let filter = TagFilter {
                    include: include.clone(),
                    exclude: exclude.clone(),
                };
                for tags in &tag_sets {
                    let expected = tags.is_disjoint(exclude)
                        && (include.is_empty() || !tags.is_disjoint(include));
                    assert_eq!(filter.admits(tags), expected, "{:?} {:?} {:?}", include, exclude, tags);
                }
            }
        }
    }
}
