use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::{
    error::{EpError, Result},
    topology::NUM_MAX_NVL_PEERS,
};

/// Number of SMs (parallel channels x 2) used by default.
pub const DEFAULT_NUM_SMS: usize = 20;

const NUM_MAX_TOPK: usize = 128;
const NUM_MAX_SCALES: usize = 128;
/// Per-token source metadata on the forwarding hop.
const SOURCE_META_BYTES: usize = 8;

pub(crate) fn align_up(value: usize, alignment: usize) -> usize {
    value.div_ceil(alignment) * alignment
}

/// Tuning parameters of a normal-mode dispatch or combine.
///
/// Tokens are split into `num_sms / 2` channels; each channel forwards at
/// most `*_chunked_send_tokens` tokens per write and the receive side holds
/// at most `*_chunked_recv_tokens` tokens per channel in flight.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub num_sms: usize,
    pub num_max_nvl_chunked_send_tokens: usize,
    pub num_max_nvl_chunked_recv_tokens: usize,
    pub num_max_rdma_chunked_send_tokens: usize,
    pub num_max_rdma_chunked_recv_tokens: usize,
}

impl Config {
    pub fn new(
        num_sms: usize,
        num_max_nvl_chunked_send_tokens: usize,
        num_max_nvl_chunked_recv_tokens: usize,
        num_max_rdma_chunked_send_tokens: usize,
        num_max_rdma_chunked_recv_tokens: usize,
    ) -> Result<Self> {
        let invalid = |msg: &str| Err(EpError::Configuration(msg.to_string()));
        if num_sms == 0 || !num_sms.is_multiple_of(2) {
            return invalid("the SM count must be even and non-zero");
        }
        if num_max_nvl_chunked_send_tokens == 0 || num_max_nvl_chunked_recv_tokens == 0 {
            return invalid("NVLink chunk sizes must be non-zero");
        }
        if num_max_nvl_chunked_send_tokens >= num_max_nvl_chunked_recv_tokens {
            return invalid("NVLink send chunk must be smaller than the receive chunk");
        }
        if num_max_rdma_chunked_send_tokens == 0 || num_max_rdma_chunked_recv_tokens == 0
        {
            return invalid("RDMA chunk sizes must be non-zero");
        }
        // The receive window is a whole number of send chunks.
        let num_max_rdma_chunked_recv_tokens =
            align_up(num_max_rdma_chunked_recv_tokens, num_max_rdma_chunked_send_tokens);
        if num_max_rdma_chunked_send_tokens > num_max_rdma_chunked_recv_tokens / 2 {
            return invalid("RDMA send chunk must fit twice in the receive window");
        }
        Ok(Self {
            num_sms,
            num_max_nvl_chunked_send_tokens,
            num_max_nvl_chunked_recv_tokens,
            num_max_rdma_chunked_send_tokens,
            num_max_rdma_chunked_recv_tokens,
        })
    }

    pub fn num_channels(&self) -> usize {
        self.num_sms / 2
    }

    /// Channel moving `token` of a batch of `num_tokens`; each channel owns a
    /// contiguous block of tokens.
    pub fn channel_of(&self, token: usize, num_tokens: usize) -> usize {
        token / self.tokens_per_channel(num_tokens)
    }

    pub fn channel_range(&self, channel: usize, num_tokens: usize) -> Range<usize> {
        let per_channel = self.tokens_per_channel(num_tokens);
        let begin = (channel * per_channel).min(num_tokens);
        begin..(begin + per_channel).min(num_tokens)
    }

    fn tokens_per_channel(&self, num_tokens: usize) -> usize {
        num_tokens.div_ceil(self.num_channels()).max(1)
    }

    /// Suggested NVLink region size for tokens of `hidden_bytes`.
    pub fn nvl_buffer_size_hint(&self, hidden_bytes: usize, num_ranks: usize) -> usize {
        let num_rdma_ranks = (num_ranks / NUM_MAX_NVL_PEERS).max(1);
        let num_nvl_ranks = num_ranks.min(NUM_MAX_NVL_PEERS);
        let slots = self.num_channels() * num_nvl_ranks;
        let tokens = slots * self.num_max_nvl_chunked_recv_tokens;

        let mut num_bytes = slots * (2 * num_rdma_ranks + 3) * size_of::<i32>();
        num_bytes += tokens * hidden_bytes;
        num_bytes += tokens * SOURCE_META_BYTES;
        num_bytes += tokens * NUM_MAX_TOPK * size_of::<i64>();
        num_bytes += tokens * NUM_MAX_TOPK * size_of::<f32>();
        num_bytes += tokens * NUM_MAX_SCALES * size_of::<f32>();
        align_up(num_bytes, 128)
    }

    /// Suggested RDMA region size for tokens of `hidden_bytes`; zero for
    /// single-node groups, which never use the RDMA region in normal mode.
    pub fn rdma_buffer_size_hint(&self, hidden_bytes: usize, num_ranks: usize) -> usize {
        if num_ranks <= NUM_MAX_NVL_PEERS {
            return 0;
        }
        let num_rdma_ranks = num_ranks / NUM_MAX_NVL_PEERS;
        let slots = self.num_channels() * num_rdma_ranks;
        // Send and receive windows.
        let tokens = slots * self.num_max_rdma_chunked_recv_tokens * 2;

        let mut num_bytes = slots * (NUM_MAX_NVL_PEERS * 2 + 2) * 2 * size_of::<i32>();
        num_bytes += tokens * hidden_bytes;
        num_bytes += tokens * SOURCE_META_BYTES;
        num_bytes += tokens * NUM_MAX_TOPK * size_of::<i64>();
        num_bytes += tokens * NUM_MAX_TOPK * size_of::<f32>();
        num_bytes += tokens * NUM_MAX_SCALES * size_of::<f32>();
        num_bytes += tokens * 16;
        align_up(num_bytes, 128)
    }
}

const DISPATCH_TABLE: [(usize, [usize; 4]); 10] = [
    (2, [24, 256, 6, 128]),
    (4, [6, 256, 6, 128]),
    (8, [6, 256, 6, 128]),
    (16, [16, 288, 20, 128]),
    (24, [8, 288, 32, 128]),
    (32, [8, 288, 32, 128]),
    (64, [20, 288, 28, 128]),
    (128, [20, 560, 32, 128]),
    (144, [32, 720, 12, 128]),
    (160, [28, 720, 12, 128]),
];

const COMBINE_TABLE: [(usize, [usize; 4]); 10] = [
    (2, [10, 256, 6, 128]),
    (4, [9, 256, 6, 128]),
    (8, [4, 256, 6, 128]),
    (16, [2, 288, 28, 128]),
    (24, [1, 288, 20, 128]),
    (32, [1, 288, 20, 128]),
    (64, [1, 288, 20, 128]),
    (128, [1, 560, 12, 128]),
    (144, [2, 720, 8, 128]),
    (160, [2, 720, 8, 128]),
];

/// Maps a group size to its tuned dispatch and combine configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConfigSelector {
    num_sms: usize,
}

impl ConfigSelector {
    pub fn new() -> Self {
        Self { num_sms: DEFAULT_NUM_SMS }
    }

    pub fn num_sms(&self) -> usize {
        self.num_sms
    }

    /// Change the SM count used by every configuration selected afterwards.
    pub fn set_num_sms(&mut self, num_sms: usize) -> Result<()> {
        if num_sms == 0 || !num_sms.is_multiple_of(2) {
            return Err(EpError::Configuration(format!(
                "the SM count must be even, got {num_sms}"
            )));
        }
        self.num_sms = num_sms;
        Ok(())
    }

    pub fn supported_num_ranks() -> impl Iterator<Item = usize> {
        DISPATCH_TABLE.iter().map(|(num_ranks, _)| *num_ranks)
    }

    pub fn dispatch(&self, num_ranks: usize) -> Result<Config> {
        self.select(&DISPATCH_TABLE, num_ranks)
    }

    pub fn combine(&self, num_ranks: usize) -> Result<Config> {
        self.select(&COMBINE_TABLE, num_ranks)
    }

    fn select(&self, table: &[(usize, [usize; 4])], num_ranks: usize) -> Result<Config> {
        let Some((_, [nvl_send, nvl_recv, rdma_send, rdma_recv])) =
            table.iter().find(|(n, _)| *n == num_ranks)
        else {
            return Err(EpError::Configuration(format!(
                "unsupported number of EP ranks: {num_ranks}"
            )));
        };
        Config::new(self.num_sms, *nvl_send, *nvl_recv, *rdma_send, *rdma_recv)
    }
}

impl Default for ConfigSelector {
    fn default() -> Self {
        Self::new()
    }
}
