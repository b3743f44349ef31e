use crate::core::Result;
use crate::journal::MessageReader;
use crate::stream::message::apply_raw;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// State folded from a stream's backlog
#[derive(Debug, Clone, PartialEq)]
pub struct CatchUp<T = Value> {
    pub state: T,
    /// Messages consumed; resume a live subscription from here
    pub count: u64,
}

/// Drain whatever `reader` has buffered and fold it into a state.
///
/// Reading stops once no message arrives within `quiescence` of the previous
/// one, or when the reader reports end-of-data. Without `initial` the fold
/// starts from an empty object.
pub async fn consume_stream_state<R>(
    reader: &mut R,
    initial: Option<Value>,
    quiescence: Duration,
) -> Result<CatchUp>
where
    R: MessageReader + ?Sized,
{
    let mut state = initial.unwrap_or_else(|| Value::Object(Default::default()));
    let mut count = 0u64;

    loop {
        match tokio::time::timeout(quiescence, reader.read()).await {
            Err(_) => break,
            Ok(Ok(None)) => break,
            Ok(Ok(Some(raw))) => {
                apply_raw(&mut state, &raw)?;
                count += 1;
            }
            Ok(Err(err)) => return Err(err),
        }
    }

    debug!(stream = reader.name(), count, "caught up");
    Ok(CatchUp { state, count })
}

/// [`consume_stream_state`] for a concrete state type
pub async fn consume_typed<T, R>(
    reader: &mut R,
    initial: Option<T>,
    quiescence: Duration,
) -> Result<CatchUp<T>>
where
    T: Serialize + DeserializeOwned,
    R: MessageReader + ?Sized,
{
    let initial = initial.map(serde_json::to_value).transpose()?;
    let CatchUp { state, count } = consume_stream_state(reader, initial, quiescence).await?;
    Ok(CatchUp {
        state: serde_json::from_value(state)?,
        count,
    })
}
