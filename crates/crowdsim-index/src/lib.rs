//! Bin-lattice spatial index for agent neighborhood queries.
//!
//! A rectangular super-region is partitioned into `div_x * div_y` equal bins,
//! plus one catch-all overflow bin for positions outside the region. Each bin
//! holds an intrusive doubly linked list of proxies; the proxies themselves
//! live in a generational arena so callers keep stable [`ProxyId`] handles
//! while agents move between bins in O(1).

use ordered_float::OrderedFloat;
use slotmap::{SlotMap, new_key_type};
use thiserror::Error;

new_key_type! {
    /// Stable handle for a proxy stored in the lattice arena.
    pub struct ProxyId;
}

/// Errors emitted when constructing a lattice.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Indicates configuration values that cannot be used (e.g., zero bin counts).
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Per-agent record held by the lattice: last-known position, current bin,
/// and sibling links within that bin's list.
#[derive(Debug, Clone, Copy)]
struct Proxy {
    agent: usize,
    x: f64,
    y: f64,
    bin: Option<usize>,
    prev: Option<ProxyId>,
    next: Option<ProxyId>,
}

/// Uniform-grid bin lattice over a rectangular super-region.
#[derive(Debug)]
pub struct BinLattice {
    origin_x: f64,
    origin_y: f64,
    size_x: f64,
    size_y: f64,
    div_x: usize,
    div_y: usize,
    /// List heads, one per bin; the final slot is the overflow bin.
    bins: Vec<Option<ProxyId>>,
    proxies: SlotMap<ProxyId, Proxy>,
}

impl BinLattice {
    /// Create a lattice covering `origin .. origin + size` with
    /// `div_x * div_y` bins plus the overflow bin.
    pub fn new(
        origin: (f64, f64),
        size: (f64, f64),
        div_x: usize,
        div_y: usize,
    ) -> Result<Self, IndexError> {
        if div_x == 0 || div_y == 0 {
            return Err(IndexError::InvalidConfig("bin divisions must be positive"));
        }
        if !(size.0 > 0.0 && size.1 > 0.0) {
            return Err(IndexError::InvalidConfig(
                "super-region dimensions must be positive",
            ));
        }
        Ok(Self {
            origin_x: origin.0,
            origin_y: origin.1,
            size_x: size.0,
            size_y: size.1,
            div_x,
            div_y,
            bins: vec![None; div_x * div_y + 1],
            proxies: SlotMap::with_key(),
        })
    }

    /// Number of proxies currently stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    /// Returns true when no proxies are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    /// Index of the catch-all bin for out-of-region positions.
    #[inline]
    fn overflow_bin(&self) -> usize {
        self.div_x * self.div_y
    }

    /// Bin index for a point. Integer truncation is the tie-break at bin
    /// boundaries; anything outside the super-region lands in the overflow bin.
    #[inline]
    fn bin_for(&self, x: f64, y: f64) -> usize {
        if x < self.origin_x
            || y < self.origin_y
            || x >= self.origin_x + self.size_x
            || y >= self.origin_y + self.size_y
        {
            return self.overflow_bin();
        }
        let ix = ((x - self.origin_x) / self.size_x * self.div_x as f64) as usize;
        let iy = ((y - self.origin_y) / self.size_y * self.div_y as f64) as usize;
        ix * self.div_y + iy
    }

    /// Register a proxy for `agent`. The proxy starts unbinned; the first
    /// [`update`](Self::update) places it.
    pub fn insert(&mut self, agent: usize) -> ProxyId {
        self.proxies.insert(Proxy {
            agent,
            x: 0.0,
            y: 0.0,
            bin: None,
            prev: None,
            next: None,
        })
    }

    /// Unlink and destroy a proxy. Calling with a stale handle is a no-op.
    pub fn remove(&mut self, id: ProxyId) {
        if self.proxies.contains_key(id) {
            self.unlink(id);
            self.proxies.remove(id);
        }
    }

    /// Record a proxy's new position, relinking it if it crossed into a
    /// different bin. Stale handles are ignored.
    pub fn update(&mut self, id: ProxyId, x: f64, y: f64) {
        let new_bin = self.bin_for(x, y);
        let Some(proxy) = self.proxies.get_mut(id) else {
            return;
        };
        proxy.x = x;
        proxy.y = y;
        if proxy.bin != Some(new_bin) {
            self.unlink(id);
            self.link(id, new_bin);
        }
    }

    /// Append to `out` every agent whose stored position lies strictly inside
    /// the disc `(center, radius)`. Results are unordered and duplicate-free.
    pub fn query(&self, center: (f64, f64), radius: f64, out: &mut Vec<usize>) {
        self.for_each_within(center, radius, &mut |agent, _| out.push(agent));
    }

    /// Closest stored agent strictly inside the disc, skipping `ignore`.
    #[must_use]
    pub fn nearest(&self, center: (f64, f64), radius: f64, ignore: Option<usize>) -> Option<usize> {
        let mut best: Option<(OrderedFloat<f64>, usize)> = None;
        self.for_each_within(center, radius, &mut |agent, dist_sq| {
            if Some(agent) == ignore {
                return;
            }
            let dist_sq = OrderedFloat(dist_sq);
            if best.is_none_or(|(min_sq, _)| dist_sq < min_sq) {
                best = Some((dist_sq, agent));
            }
        });
        best.map(|(_, agent)| agent)
    }

    /// Visit `(agent, dist_sq)` for every proxy strictly inside the disc.
    ///
    /// Only bins overlapping the disc are walked. If the disc lies entirely
    /// outside the super-region, just the overflow bin is scanned; if it is
    /// clipped against the region boundary, the overflow bin is scanned in
    /// addition to the clipped bin range.
    pub fn for_each_within(
        &self,
        center: (f64, f64),
        radius: f64,
        visitor: &mut dyn FnMut(usize, f64),
    ) {
        let (cx, cy) = center;
        let radius_sq = radius * radius;

        let completely_outside = cx + radius < self.origin_x
            || cy + radius < self.origin_y
            || cx - radius >= self.origin_x + self.size_x
            || cy - radius >= self.origin_y + self.size_y;
        if completely_outside {
            self.scan_list(self.bins[self.overflow_bin()], cx, cy, radius_sq, visitor);
            return;
        }

        let mut min_ix = ((cx - radius - self.origin_x) / self.size_x * self.div_x as f64) as i64;
        let mut min_iy = ((cy - radius - self.origin_y) / self.size_y * self.div_y as f64) as i64;
        let mut max_ix = ((cx + radius - self.origin_x) / self.size_x * self.div_x as f64) as i64;
        let mut max_iy = ((cy + radius - self.origin_y) / self.size_y * self.div_y as f64) as i64;

        let mut clipped = false;
        if min_ix < 0 {
            clipped = true;
            min_ix = 0;
        }
        if min_iy < 0 {
            clipped = true;
            min_iy = 0;
        }
        if max_ix >= self.div_x as i64 {
            clipped = true;
            max_ix = self.div_x as i64 - 1;
        }
        if max_iy >= self.div_y as i64 {
            clipped = true;
            max_iy = self.div_y as i64 - 1;
        }

        if clipped {
            self.scan_list(self.bins[self.overflow_bin()], cx, cy, radius_sq, visitor);
        }
        for ix in min_ix..=max_ix {
            for iy in min_iy..=max_iy {
                let bin = ix as usize * self.div_y + iy as usize;
                self.scan_list(self.bins[bin], cx, cy, radius_sq, visitor);
            }
        }
    }

    /// Unlink everything, leaving an empty lattice.
    pub fn clear(&mut self) {
        self.bins.fill(None);
        self.proxies.clear();
    }

    fn scan_list(
        &self,
        head: Option<ProxyId>,
        cx: f64,
        cy: f64,
        radius_sq: f64,
        visitor: &mut dyn FnMut(usize, f64),
    ) {
        let mut cursor = head;
        while let Some(id) = cursor {
            let proxy = &self.proxies[id];
            let dx = proxy.x - cx;
            let dy = proxy.y - cy;
            let dist_sq = dx * dx + dy * dy;
            if dist_sq < radius_sq {
                visitor(proxy.agent, dist_sq);
            }
            cursor = proxy.next;
        }
    }

    /// Push the proxy onto the front of `bin`'s list.
    fn link(&mut self, id: ProxyId, bin: usize) {
        let old_head = self.bins[bin];
        if let Some(head) = old_head {
            self.proxies[head].prev = Some(id);
        }
        let proxy = &mut self.proxies[id];
        proxy.prev = None;
        proxy.next = old_head;
        proxy.bin = Some(bin);
        self.bins[bin] = Some(id);
    }

    /// Detach the proxy from its bin list, if it is on one.
    fn unlink(&mut self, id: ProxyId) {
        let Proxy {
            bin, prev, next, ..
        } = self.proxies[id];
        if let Some(bin) = bin {
            if self.bins[bin] == Some(id) {
                self.bins[bin] = next;
            }
            if let Some(prev) = prev {
                self.proxies[prev].next = next;
            }
            if let Some(next) = next {
                self.proxies[next].prev = prev;
            }
        }
        let proxy = &mut self.proxies[id];
        proxy.bin = None;
        proxy.prev = None;
        proxy.next = None;
    }
}
