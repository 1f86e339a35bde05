//! Aggregation of several independent failures into one error value.

use std::fmt;

/// A collection of errors reported as a single error.
///
/// Used wherever one operation fans out into several sub-operations that can
/// each fail independently (batch retries, compensation walks) and every
/// failure must be surfaced rather than only the first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiError<E> {
    errors: Vec<E>,
}

impl<E> MultiError<E> {
    /// Creates an empty collection.
    pub fn new() -> Self {
        Self { errors: Vec::new() }
    }

    /// Adds an error.
    pub fn push(&mut self, error: E) {
        self.errors.push(error);
    }

    /// Number of collected errors.
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Returns true if no error was collected.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Iterates over the collected errors in insertion order.
    pub fn iter(&self) -> std::slice::Iter<'_, E> {
        self.errors.iter()
    }

    /// Returns the collected errors.
    pub fn into_inner(self) -> Vec<E> {
        self.errors
    }

    /// Returns `Ok(())` when empty, the collection itself otherwise.
    pub fn into_result(self) -> Result<(), Self> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl<E> Default for MultiError<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> FromIterator<E> for MultiError<E> {
    fn from_iter<I: IntoIterator<Item = E>>(iter: I) -> Self {
        Self {
            errors: iter.into_iter().collect(),
        }
    }
}

impl<E> Extend<E> for MultiError<E> {
    fn extend<I: IntoIterator<Item = E>>(&mut self, iter: I) {
        self.errors.extend(iter);
    }
}

impl<E> IntoIterator for MultiError<E> {
    type Item = E;
    type IntoIter = std::vec::IntoIter<E>;

    fn into_iter(self) -> Self::IntoIter {
        self.errors.into_iter()
    }
}

impl<E: fmt::Display> fmt::Display for MultiError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errors.as_slice() {
            [] => Ok(()),
            [only] => write!(f, "{only}"),
            errors => {
                write!(f, "{} errors occurred:", errors.len())?;
                for (i, err) in errors.iter().enumerate() {
                    write!(f, "\n\t* [{}] {err}", i + 1)?;
                }
                Ok(())
            }
        }
    }
}

impl<E> std::error::Error for MultiError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.errors
            .first()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Boom(&'static str);

    impl fmt::Display for Boom {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "boom: {}", self.0)
        }
    }

    impl std::error::Error for Boom {}

    #[test]
    fn empty_collection_is_ok() {
        let errs: MultiError<Boom> = MultiError::new();
        assert!(errs.is_empty());
        assert!(errs.into_result().is_ok());
    }

    #[test]
    fn single_error_displays_verbatim() {
        let errs: MultiError<Boom> = std::iter::once(Boom("a")).collect();
        assert_eq!(errs.to_string(), "boom: a");
    }

    #[test]
    fn multiple_errors_are_enumerated() {
        let mut errs = MultiError::new();
        errs.push(Boom("a"));
        errs.push(Boom("b"));
        assert_eq!(errs.len(), 2);
        assert_eq!(
            errs.to_string(),
            "2 errors occurred:\n\t* [1] boom: a\n\t* [2] boom: b"
        );
    }

    #[test]
    fn source_is_first_error() {
        use std::error::Error;

        let errs: MultiError<Boom> = vec![Boom("first"), Boom("second")].into_iter().collect();
        assert_eq!(errs.source().unwrap().to_string(), "boom: first");
    }
}
