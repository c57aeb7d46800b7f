use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;

use log::debug;
use tokio::time::Instant;

use crate::app::CoapError;
use crate::msg::option::{block_offset, block_size, block_value};
use crate::msg::{BlockValue, CoapOption, Message};

/// Default (and largest) block size, `szx = 6`.
pub const DEFAULT_BLOCK_SIZE: usize = 1024;

/// Default cap on a reassembled Block1 request body.
pub const DEFAULT_MAX_BLOCK1_PAYLOAD: usize = 64 * 1024;

/// Rough per-message overhead (header, token, options) subtracted from the MTU when picking a
/// block size.
const MESSAGE_OVERHEAD: usize = 64;

#[derive(Debug, Clone, Copy)]
pub struct BlockConfig {
    pub block_size: usize,
    pub max_block1_payload: usize,
    pub lifetime: Duration,
}

impl BlockConfig {
    /// Largest power of two block size in 16..=1024 that fits the link MTU alongside a
    /// message header.
    pub fn block_size_for_mtu(mtu: Option<u32>) -> usize {
        let available = mtu
            .map(|mtu| (mtu as usize).saturating_sub(MESSAGE_OVERHEAD))
            .unwrap_or(DEFAULT_BLOCK_SIZE);
        let mut size = DEFAULT_BLOCK_SIZE;
        while size > 16 && size > available {
            size /= 2;
        }
        size
    }
}

/// Request bodies are reassembled per (peer, path).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Block1Key<Endpoint> {
    peer: Endpoint,
    path: String,
}

/// Response snapshots are retained per (peer, path, token).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Block2Key<Endpoint> {
    peer: Endpoint,
    path: String,
    token: Vec<u8>,
}

#[derive(Debug)]
struct Block1Context {
    block_number: u32,
    size_exponent: u8,
    payload: Vec<u8>,
    touched_at: Instant,
}

#[derive(Debug)]
struct Block2Context {
    snapshot: Message,
    touched_at: Instant,
}

/// Result of feeding a request through Block1 reassembly.
#[derive(Debug, Clone, PartialEq)]
pub enum Block1Step {
    /// More fragments expected; answer 2.31 Continue echoing this block.
    Continue(BlockValue),
    /// The request body is complete and may be dispatched.  Carries the final Block1 value to
    /// echo in the response, if the request was blockwise at all.
    Complete(Option<BlockValue>),
}

/// Transparent blockwise transfer (RFC 7959): reassembles Block1 request bodies and slices
/// oversized responses into Block2 fragments, retaining a snapshot of the full response until
/// the client has pulled every block.
pub struct BlockHandler<Endpoint> {
    config: BlockConfig,
    block1: HashMap<Block1Key<Endpoint>, Block1Context>,
    block2: HashMap<Block2Key<Endpoint>, Block2Context>,
}

impl<Endpoint: Debug + Clone + Eq + Hash> BlockHandler<Endpoint> {
    pub fn new(config: BlockConfig) -> Self {
        Self {
            config,
            block1: HashMap::new(),
            block2: HashMap::new(),
        }
    }

    fn purge_expired(&mut self, now: Instant) {
        let lifetime = self.config.lifetime;
        self.block1
            .retain(|_, ctx| now.duration_since(ctx.touched_at) < lifetime);
        self.block2
            .retain(|_, ctx| now.duration_since(ctx.touched_at) < lifetime);
    }

    /// Accumulates a Block1 fragment.  On the final fragment the complete body replaces the
    /// request payload.
    pub fn intercept_request(
        &mut self,
        peer: &Endpoint,
        request: &mut Message,
    ) -> Result<Block1Step, CoapError> {
        let now = Instant::now();
        self.purge_expired(now);

        let block = match request.get_block1()? {
            Some(block) => block,
            None => return Ok(Block1Step::Complete(None)),
        };
        let key = Block1Key {
            peer: peer.clone(),
            path: request.get_path(),
        };
        let num = block.num as u32;

        if num == 0 {
            self.block1.insert(
                key.clone(),
                Block1Context {
                    block_number: 0,
                    size_exponent: block.size_exponent,
                    payload: Vec::new(),
                    touched_at: now,
                },
            );
        } else {
            let ctx = self.block1.get(&key).ok_or_else(CoapError::request_entity_incomplete)?;
            if ctx.size_exponent != block.size_exponent {
                debug!("Block1 size changed mid-transfer from {peer:?}");
                self.block1.remove(&key);
                return Err(CoapError::request_entity_incomplete());
            }
            if num == ctx.block_number {
                // Retransmitted fragment we already hold.
                return Ok(if block.more {
                    Block1Step::Continue(block)
                } else {
                    Block1Step::Complete(Some(block))
                });
            }
            if num != ctx.block_number + 1 {
                debug!(
                    "Block1 out of order from {peer:?}: expected {}, got {}",
                    ctx.block_number + 1,
                    num
                );
                self.block1.remove(&key);
                return Err(CoapError::request_entity_incomplete());
            }
        }

        let max = self.config.max_block1_payload;
        let ctx = self
            .block1
            .get_mut(&key)
            .ok_or_else(CoapError::request_entity_incomplete)?;
        if ctx.payload.len() + request.payload.len() > max {
            self.block1.remove(&key);
            return Err(CoapError::request_entity_too_large(max));
        }
        ctx.block_number = num;
        ctx.touched_at = now;
        ctx.payload.extend_from_slice(&request.payload);

        if block.more {
            return Ok(Block1Step::Continue(block));
        }

        let assembled = self.block1.remove(&key).map(|ctx| ctx.payload).unwrap_or_default();
        debug!("Block1 transfer from {peer:?} complete: {} bytes", assembled.len());
        request.payload = assembled;
        request.clear_option(CoapOption::Block1);
        request.clear_option(CoapOption::Size1);
        Ok(Block1Step::Complete(Some(block)))
    }

    /// Serves a follow-up Block2 request from a retained snapshot, if there is one.
    pub fn serve_cached(
        &mut self,
        peer: &Endpoint,
        request: &Message,
    ) -> Result<Option<Message>, CoapError> {
        let now = Instant::now();
        self.purge_expired(now);

        let block = match request.get_block2()? {
            Some(block) if block.num > 0 => block,
            _ => return Ok(None),
        };
        let key = Block2Key {
            peer: peer.clone(),
            path: request.get_path(),
            token: request.get_token().to_vec(),
        };
        let snapshot = match self.block2.get_mut(&key) {
            Some(ctx) => {
                ctx.touched_at = now;
                ctx.snapshot.clone()
            }
            None => return Ok(None),
        };

        let mut response = snapshot;
        let more = slice_payload(&mut response, block)?;
        if !more {
            self.block2.remove(&key);
        }
        Ok(Some(response))
    }

    /// Slices `response` if it is larger than the negotiated block size (or the client asked
    /// for a specific block), retaining the full response for follow-up requests.
    pub fn intercept_response(
        &mut self,
        peer: &Endpoint,
        request: &Message,
        response: &mut Message,
    ) -> Result<(), CoapError> {
        let requested = request.get_block2().ok().flatten();
        let asked = requested.is_some();
        let preferred = block_value(0, false, self.config.block_size)?;
        let block = match requested {
            Some(requested) if block_size(&requested) < block_size(&preferred) => requested,
            Some(requested) => block_value(
                (block_offset(&requested) / block_size(&preferred)) as u32,
                false,
                block_size(&preferred),
            )?,
            None => preferred,
        };

        if !asked && response.payload.len() <= block_size(&block) {
            return Ok(());
        }

        let key = Block2Key {
            peer: peer.clone(),
            path: request.get_path(),
            token: request.get_token().to_vec(),
        };
        let snapshot = response.clone();
        let more = slice_payload(response, block)?;
        if more {
            debug!("Retaining Block2 snapshot for {peer:?} /{}", key.path);
            self.block2.insert(
                key,
                Block2Context {
                    snapshot,
                    touched_at: Instant::now(),
                },
            );
        } else {
            self.block2.remove(&key);
        }
        Ok(())
    }
}

/// Cuts block `block` out of the message payload and stamps Block2/Size2.  Returns the more
/// flag.
fn slice_payload(message: &mut Message, block: BlockValue) -> Result<bool, CoapError> {
    let total = message.payload.len();
    let offset = block_offset(&block);
    if offset > 0 && offset >= total {
        return Err(CoapError::for_code(
            crate::msg::ResponseType::BadOption,
            "Block2 number beyond end of resource",
        ));
    }
    let end = (offset + block_size(&block)).min(total);
    let more = end < total;
    message.payload = message.payload[offset..end].to_vec();
    message.set_block2(block_value(block.num as u32, more, block_size(&block))?);
    message.set_uint_option(CoapOption::Size2, total as u32);
    Ok(more)
}
