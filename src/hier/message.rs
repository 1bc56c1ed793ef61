use std::fmt;

use anyhow::bail;

use crate::base::ComponentId;
use crate::hier::line::LineState;
use crate::timeq::Cycle;

/// Bytes of routing/command header carried by every coherence message.
pub const HEADER_BYTES: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CohKind {
    GetS,
    GetM,
    PutS,
    PutM,
    Inv,
    FwdGetS,
    FwdGetM,
    /// Downward: a grant answering GetS/GetM.  Upward: a snoop reply carrying the line.
    Data,
    /// Downward: put acknowledgement.  Upward: invalidation acknowledgement.
    Ack,
}

impl CohKind {
    pub fn name(self) -> &'static str {
        match self {
            CohKind::GetS => "GetS",
            CohKind::GetM => "GetM",
            CohKind::PutS => "PutS",
            CohKind::PutM => "PutM",
            CohKind::Inv => "Inv",
            CohKind::FwdGetS => "FwdGetS",
            CohKind::FwdGetM => "FwdGetM",
            CohKind::Data => "Data",
            CohKind::Ack => "Ack",
        }
    }

    /// Requests that parents answer with a grant.
    pub fn is_get(self) -> bool {
        matches!(self, CohKind::GetS | CohKind::GetM)
    }

    pub fn is_put(self) -> bool {
        matches!(self, CohKind::PutS | CohKind::PutM)
    }

    /// Parent-to-child requests that must be answered with Data or Ack.
    pub fn is_snoop(self) -> bool {
        matches!(self, CohKind::Inv | CohKind::FwdGetS | CohKind::FwdGetM)
    }
}

impl fmt::Display for CohKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Permission handed out with a Data grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grant {
    Shared,
    Modified,
}

impl Grant {
    pub fn state(self) -> LineState {
        match self {
            Grant::Shared => LineState::Shared,
            Grant::Modified => LineState::Modified,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoherenceMessage {
    pub id: u64,
    pub kind: CohKind,
    pub src: ComponentId,
    pub dst: ComponentId,
    /// Always line aligned.
    pub addr: u64,
    pub grant: Option<Grant>,
    pub data: Option<Vec<u8>>,
    pub dirty: bool,
}

impl CoherenceMessage {
    pub fn new(kind: CohKind, src: ComponentId, dst: ComponentId, addr: u64) -> Self {
        Self {
            id: 0,
            kind,
            src,
            dst,
            addr,
            grant: None,
            data: None,
            dirty: false,
        }
    }

    pub fn with_data(mut self, data: Vec<u8>, dirty: bool) -> Self {
        self.data = Some(data);
        self.dirty = dirty;
        self
    }

    pub fn with_grant(mut self, grant: Grant) -> Self {
        self.grant = Some(grant);
        self
    }

    pub fn size_bytes(&self) -> u32 {
        HEADER_BYTES + self.data.as_ref().map_or(0, |d| d.len() as u32)
    }
}

impl fmt::Display for CoherenceMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{} {:#x} {}->{}", self.kind, self.id, self.addr, self.src, self.dst)?;
        if let Some(grant) = self.grant {
            write!(f, " grant={:?}", grant)?;
        }
        if self.dirty {
            f.write_str(" dirty")?;
        }
        Ok(())
    }
}

/// Width of every CPU load and store.
pub const WORD_BYTES: u64 = 8;

/// One load or store issued by a CPU.  Accesses are 8-byte words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuRequest {
    pub id: u64,
    pub addr: u64,
    pub write: bool,
    /// Stored value for writes.
    pub value: u64,
    pub issued_at: Cycle,
}

/// A word access must lie inside a single cache line.
pub fn check_word_access(addr: u64, line_size: u64) -> anyhow::Result<()> {
    if addr % line_size + WORD_BYTES > line_size {
        bail!(
            "{}-byte access at {:#x} crosses a {}-byte line boundary",
            WORD_BYTES,
            addr,
            line_size
        );
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuResponse {
    pub id: u64,
    pub addr: u64,
    pub write: bool,
    /// Value read, or the value written.
    pub value: u64,
    pub issued_at: Cycle,
}

impl CpuResponse {
    pub fn for_request(req: &CpuRequest, value: u64) -> Self {
        Self {
            id: req.id,
            addr: req.addr,
            write: req.write,
            value,
            issued_at: req.issued_at,
        }
    }
}

/// Source of unique message ids, one per controller.
#[derive(Debug, Default)]
pub struct MessageIds {
    owner: ComponentId,
    next: u64,
}

impl MessageIds {
    pub fn new(owner: ComponentId) -> Self {
        Self { owner, next: 0 }
    }

    pub fn next(&mut self) -> u64 {
        self.next += 1;
        ((self.owner as u64) << 40) | self.next
    }
}
