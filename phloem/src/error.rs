//! Error types.

use thiserror::Error;

/// Returned by [`Mediator::add_source`](`crate::Mediator::add_source`) when
/// the same upstream is already recorded with a *different* observer.
///
/// Recoverable: the existing registration is left untouched.
#[derive(Debug, PartialEq, Eq, Error)]
#[error("upstream is already attached to this mediator with a different observer")]
pub struct SourceConflict(pub(crate) ());
