use sagaline_deferred::Deferred;

use crate::composer::Composer;
use crate::error::ComposeError;
use crate::options::ComposeOptions;

/// Compose a chain with default options and no payload.
///
/// `setup` runs synchronously on the calling thread, so every step whose
/// predecessor is already resolved runs before this returns.
///
/// # Errors
///
/// Returns the error `setup` returns; errors inside registered steps end up in
/// the returned operation instead.
pub fn compose<F>(setup: F) -> Result<Deferred, ComposeError>
where
    F: FnOnce(&mut Composer) -> Result<(), ComposeError>,
{
    compose_with((), ComposeOptions::default(), setup)
}

/// Compose a chain carrying `payload`, configured by `options`.
///
/// # Errors
///
/// Returns the error `setup` returns.
pub fn compose_with<T, F>(
    payload: T,
    options: ComposeOptions,
    setup: F,
) -> Result<Deferred, ComposeError>
where
    T: Send + Sync + 'static,
    F: FnOnce(&mut Composer<T>) -> Result<(), ComposeError>,
{
    let mut composer = Composer::new(payload, options);
    setup(&mut composer)?;
    Ok(composer.finish())
}
