use std::sync::OnceLock;

/// Write-once cache for a value derived from immutable fields.
///
/// The initializer must be a pure function of the owner's immutable state, so
/// concurrent readers racing to populate the cell compute the same value and
/// the first write wins. Clones start unpopulated: a cloned descriptor must
/// never share cache state with its original.
#[derive(Debug, Default)]
pub struct Memo<T>(OnceLock<T>);

impl<T> Memo<T> {
    #[inline]
    pub const fn new() -> Self {
        Self(OnceLock::new())
    }

    #[inline]
    pub fn get_or_init(&self, f: impl FnOnce() -> T) -> &T {
        self.0.get_or_init(f)
    }

    /// Fallible initialization. Errors are not cached: a failed computation
    /// leaves the cell empty and is retried on the next access.
    pub fn try_get_or_init<E>(&self, f: impl FnOnce() -> Result<T, E>) -> Result<&T, E> {
        if let Some(value) = self.0.get() {
            return Ok(value);
        }
        let value = f()?;
        Ok(self.0.get_or_init(|| value))
    }
}

impl<T> Clone for Memo<T> {
    #[inline]
    fn clone(&self) -> Self {
        Self(OnceLock::new())
    }
}
