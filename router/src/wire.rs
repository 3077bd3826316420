//! Conversions between the wire `TensorMessage` and the core's `Payload`
//! items. A message carries a flat buffer (numeric or opaque) plus an
//! item count `n`; this module splits that flat buffer into `n` equal
//! chunks on the way in, and re-joins per-item chunks on the way out.

use batching_proto::TensorMessage;

use crate::backend::Payload;
use crate::error::RouterError;

pub fn split_items(message: &TensorMessage) -> Result<Vec<Payload>, RouterError> {
    let n = message.n as usize;
    if n == 0 {
        return Err(RouterError::Malformed("n must be positive".into()));
    }

    if !message.buffer.is_empty() {
        split_tensor(&message.buffer, n)
    } else if !message.serialized_buffer.is_empty() {
        split_opaque(&message.serialized_buffer, n)
    } else {
        Err(RouterError::Malformed(
            "exactly one of buffer or serialized_buffer must be populated".into(),
        ))
    }
}

fn split_tensor(buffer: &[f32], n: usize) -> Result<Vec<Payload>, RouterError> {
    if buffer.len() % n != 0 {
        return Err(RouterError::Malformed(format!(
            "buffer of length {} does not divide evenly into {n} items",
            buffer.len()
        )));
    }
    let chunk_len = buffer.len() / n;
    Ok(buffer
        .chunks(chunk_len)
        .map(|chunk| Payload::Tensor(chunk.to_vec()))
        .collect())
}

fn split_opaque(buffer: &[u8], n: usize) -> Result<Vec<Payload>, RouterError> {
    if buffer.len() % n != 0 {
        return Err(RouterError::Malformed(format!(
            "serialized buffer of length {} does not divide evenly into {n} items",
            buffer.len()
        )));
    }
    let chunk_len = buffer.len() / n;
    Ok(buffer
        .chunks(chunk_len)
        .map(|chunk| Payload::Opaque(chunk.to_vec()))
        .collect())
}

/// Re-flatten per-client output items into a response `TensorMessage`.
/// All items must be of the same payload kind; mixed kinds within one
/// client slice would indicate a backend bug.
pub fn join_items(client_id: String, items: Vec<Payload>) -> Result<TensorMessage, RouterError> {
    let n = items.len() as u32;
    let all_tensor = items.iter().all(|item| matches!(item, Payload::Tensor(_)));

    let mut message = TensorMessage {
        client_id,
        n,
        k: 0,
        nr: 0,
        nc: 0,
        buffer: Vec::new(),
        serialized_buffer: Vec::new(),
    };

    if all_tensor {
        for item in items {
            match item {
                Payload::Tensor(values) => message.buffer.extend(values),
                Payload::Opaque(_) => unreachable!("all_tensor checked above"),
            }
        }
    } else {
        for item in items {
            match item {
                Payload::Opaque(bytes) => message.serialized_buffer.extend(bytes),
                Payload::Tensor(_) => {
                    return Err(RouterError::Malformed(
                        "backend returned a mix of tensor and opaque payloads".into(),
                    ))
                }
            }
        }
    }

    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_tensor_buffer_evenly() {
        let message = TensorMessage {
            client_id: "a".into(),
            n: 2,
            k: 0,
            nr: 0,
            nc: 0,
            buffer: vec![1.0, 2.0, 3.0, 4.0],
            serialized_buffer: vec![],
        };
        let items = split_items(&message).unwrap();
        assert_eq!(
            items,
            vec![
                Payload::Tensor(vec![1.0, 2.0]),
                Payload::Tensor(vec![3.0, 4.0])
            ]
        );
    }

    #[test]
    fn rejects_buffer_not_divisible_by_n() {
        let message = TensorMessage {
            client_id: "a".into(),
            n: 3,
            k: 0,
            nr: 0,
            nc: 0,
            buffer: vec![1.0, 2.0],
            serialized_buffer: vec![],
        };
        assert!(split_items(&message).is_err());
    }

    #[test]
    fn opaque_buffer_round_trips() {
        let original = vec![9u8, 8, 7, 6, 5, 4];
        let message = TensorMessage {
            client_id: "a".into(),
            n: 3,
            k: 0,
            nr: 0,
            nc: 0,
            buffer: vec![],
            serialized_buffer: original.clone(),
        };
        let items = split_items(&message).unwrap();
        let joined = join_items("a".into(), items).unwrap();
        assert_eq!(joined.serialized_buffer, original);
    }
}
