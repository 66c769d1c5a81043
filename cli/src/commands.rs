//! Command implementations.

use std::io::{self, Write};
use std::ops::ControlFlow;

use confwatch::{
    CloseReason, ConfigStore, KeySpace, Revision, Synchronizer, ViewSink, ViewSnapshot, Writer,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::Error;

/// Stores `value` as `variable` of `entity`.
pub async fn config<S, W>(
    store: S,
    keys: &KeySpace,
    entity: &str,
    variable: &str,
    value: &str,
    out: &mut W,
) -> Result<Revision, Error>
where
    S: ConfigStore,
    W: Write + ?Sized,
{
    let key = keys.key(entity, variable)?;
    let revision = Writer::new(store, keys.clone())
        .write(entity, variable, value)
        .await?;

    writeln!(out, "put {}={}", key, value)?;
    Ok(revision)
}

/// Removes `variable` of `entity`. Removing a variable that is not set is
/// not an error.
pub async fn unset<S, W>(
    store: S,
    keys: &KeySpace,
    entity: &str,
    variable: &str,
    out: &mut W,
) -> Result<Option<Revision>, Error>
where
    S: ConfigStore,
    W: Write + ?Sized,
{
    let key = keys.key(entity, variable)?;
    let revision = Writer::new(store, keys.clone())
        .unset(entity, variable)
        .await?;

    writeln!(out, "delete {}", key)?;
    Ok(revision)
}

/// Prints each published view on its own line and stops the run on the first
/// output error.
struct PrintSink<'a, W: ?Sized> {
    out: &'a mut W,
    error: Option<io::Error>,
}

impl<W: Write + ?Sized> ViewSink for PrintSink<'_, W> {
    fn publish(&mut self, view: ViewSnapshot) -> ControlFlow<()> {
        let written = writeln!(self.out, "{}", view).and_then(|()| self.out.flush());
        match written {
            Ok(()) => ControlFlow::Continue(()),
            Err(e) => {
                self.error = Some(e);
                ControlFlow::Break(())
            }
        }
    }
}

/// Follows the configuration of `entity` until `cancel` fires or the watch
/// ends, printing every view.
pub async fn server<S, W>(
    store: S,
    keys: &KeySpace,
    entity: &str,
    cancel: CancellationToken,
    out: &mut W,
) -> Result<CloseReason, Error>
where
    S: ConfigStore,
    W: Write + ?Sized,
{
    let mut sync = Synchronizer::new(store, keys, entity)?.with_cancellation(cancel);
    info!(entity, prefix = sync.prefix(), "following configuration");

    let mut sink = PrintSink { out, error: None };
    let reason = sync.run(&mut sink).await?;

    if let Some(e) = sink.error {
        return Err(e.into());
    }
    debug!(?reason, "stopped following");
    Ok(reason)
}
