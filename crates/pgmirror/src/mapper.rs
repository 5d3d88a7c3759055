//! Two-way dictionary between stored codes and displayed values

use std::collections::BTreeMap;

/// Maps values as stored in the database (`B`) to values as shown to users
/// (`S`) and back. Registering a pair again replaces both directions.
#[derive(Debug, Clone)]
pub struct ValueMapper<B, S> {
    to_screen: BTreeMap<B, S>,
    to_base: BTreeMap<S, B>,
    unknown_base: Option<B>,
    unknown_screen: Option<S>,
}

impl<B, S> Default for ValueMapper<B, S> {
    fn default() -> Self {
        Self {
            to_screen: BTreeMap::new(),
            to_base: BTreeMap::new(),
            unknown_base: None,
            unknown_screen: None,
        }
    }
}

impl<B, S> ValueMapper<B, S>
where
    B: Ord + Clone,
    S: Ord + Clone,
{
    pub fn new(pairs: impl IntoIterator<Item = (B, S)>) -> Self {
        let mut mapper = Self::default();
        for (base, screen) in pairs {
            mapper.register(base, screen);
        }
        mapper
    }

    /// Values returned by the `*_or_unknown` lookups for unmapped keys
    pub fn with_unknown(mut self, base: B, screen: S) -> Self {
        self.unknown_base = Some(base);
        self.unknown_screen = Some(screen);
        self
    }

    pub fn register(&mut self, base: B, screen: S) {
        if let Some(old_screen) = self.to_screen.insert(base.clone(), screen.clone()) {
            self.to_base.remove(&old_screen);
        }
        if let Some(old_base) = self.to_base.insert(screen.clone(), base.clone()) {
            if old_base != base {
                self.to_screen.remove(&old_base);
            }
        }
    }

    pub fn to_screen(&self, base: &B) -> Option<&S> {
        self.to_screen.get(base)
    }

    pub fn to_base(&self, screen: &S) -> Option<&B> {
        self.to_base.get(screen)
    }

    /// Displayed value for a stored one, falling back to the unknown
    /// sentinel (or `S::default()` without one)
    pub fn to_screen_or_unknown(&self, base: &B) -> S
    where
        S: Default,
    {
        self.to_screen(base)
            .or(self.unknown_screen.as_ref())
            .cloned()
            .unwrap_or_default()
    }

    pub fn to_base_or_unknown(&self, screen: &S) -> B
    where
        B: Default,
    {
        self.to_base(screen)
            .or(self.unknown_base.as_ref())
            .cloned()
            .unwrap_or_default()
    }

    /// All displayed values, sorted
    pub fn screen_values(&self) -> Vec<S> {
        self.to_base.keys().cloned().collect()
    }

    /// All stored values, sorted
    pub fn base_values(&self) -> Vec<B> {
        self.to_screen.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.to_screen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.to_screen.is_empty()
    }
}
