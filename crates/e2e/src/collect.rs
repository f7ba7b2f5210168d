//! Test items, their fixtures, and the `requires_app` tagging pass

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;

use tracing::debug;

use crate::decorators::TestFn;

/// Fixture name of the session's application manager
pub const APP_FIXTURE: &str = "app_manager";

/// Mark put on items that need the application running
pub const REQUIRES_APP: &str = "requires_app";

/// Fixture name to the fixtures it depends on
#[derive(Debug, Clone, Default)]
pub struct FixtureGraph {
    deps: HashMap<String, Vec<String>>,
}

impl FixtureGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a fixture and its direct dependencies
    pub fn fixture(mut self, name: &str, deps: &[&str]) -> Self {
        self.deps.insert(
            name.to_string(),
            deps.iter().map(|d| d.to_string()).collect(),
        );
        self
    }

    /// Every fixture reachable from `roots`, roots included. Cycles are fine.
    pub fn closure<'a, I>(&self, roots: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&str> = roots.into_iter().collect();

        while let Some(name) = queue.pop_front() {
            if !seen.insert(name.to_string()) {
                continue;
            }
            if let Some(deps) = self.deps.get(name) {
                queue.extend(deps.iter().map(String::as_str));
            }
        }

        seen
    }
}

/// One runnable test
pub struct TestItem {
    id: String,
    fixtures: Vec<String>,
    marks: BTreeSet<String>,
    body: Box<dyn TestFn>,
}

impl TestItem {
    pub fn new(id: impl Into<String>, body: impl TestFn + 'static) -> Self {
        Self {
            id: id.into(),
            fixtures: Vec::new(),
            marks: BTreeSet::new(),
            body: Box::new(body),
        }
    }

    /// Declare a fixture this test uses directly
    pub fn uses(mut self, fixture: &str) -> Self {
        self.fixtures.push(fixture.to_string());
        self
    }

    pub fn mark(mut self, mark: &str) -> Self {
        self.add_mark(mark);
        self
    }

    pub fn add_mark(&mut self, mark: &str) {
        self.marks.insert(mark.to_string());
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn fixtures(&self) -> &[String] {
        &self.fixtures
    }

    pub fn marks(&self) -> &BTreeSet<String> {
        &self.marks
    }

    pub fn has_mark(&self, mark: &str) -> bool {
        self.marks.contains(mark)
    }

    pub fn requires_app(&self) -> bool {
        self.has_mark(REQUIRES_APP)
    }

    pub fn body(&self) -> &dyn TestFn {
        self.body.as_ref()
    }
}

impl fmt::Debug for TestItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestItem")
            .field("id", &self.id)
            .field("fixtures", &self.fixtures)
            .field("marks", &self.marks)
            .finish_non_exhaustive()
    }
}

/// Mark every item that reaches [`APP_FIXTURE`] through its fixtures.
///
/// Returns how many items require the application afterwards.
pub fn tag_requires_app(items: &mut [TestItem], fixtures: &FixtureGraph) -> usize {
    let mut tagged = 0;

    for item in items.iter_mut() {
        if !item.requires_app() {
            let closure = fixtures.closure(item.fixtures.iter().map(String::as_str));
            if closure.contains(APP_FIXTURE) {
                debug!(test = %item.id, "tagging test as requiring the application");
                item.add_mark(REQUIRES_APP);
            }
        }
        if item.requires_app() {
            tagged += 1;
        }
    }

    tagged
}
