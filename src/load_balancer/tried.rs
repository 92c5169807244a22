//! Per-request record of peers that must not be selected again.

/// Bitmap with one bit per peer index.
///
/// Bits are only ever set. Indices past the allocated words read as clear,
/// so a registry that grew after the request started is handled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriedPeers {
    words: Vec<usize>,
}

const BITS: usize = usize::BITS as usize;

impl TriedPeers {
    /// Bitmap large enough for `peers` indices.
    pub fn with_capacity(peers: usize) -> Self {
        Self {
            words: vec![0; peers.div_ceil(BITS)],
        }
    }

    fn position(index: usize) -> (usize, usize) {
        (index / BITS, 1 << (index % BITS))
    }

    pub fn contains(&self, index: usize) -> bool {
        let (word, mask) = Self::position(index);
        self.words.get(word).is_some_and(|w| w & mask != 0)
    }

    /// Mark `index` as tried. Returns false if it already was.
    pub fn insert(&mut self, index: usize) -> bool {
        let (word, mask) = Self::position(index);
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        let was_set = self.words[word] & mask != 0;
        self.words[word] |= mask;
        !was_set
    }

    /// Number of tried peers.
    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// The same peers after the registry moved them. `positions[old]` is the
    /// new index of peer `old`, `None` if it was removed.
    pub fn remap(&self, positions: &[Option<usize>]) -> TriedPeers {
        let mut next = TriedPeers::with_capacity(positions.len());
        for index in self.iter() {
            if let Some(&Some(moved)) = positions.get(index) {
                next.insert(moved);
            }
        }
        next
    }

    /// Tried indices in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(n, &word)| {
            (0..BITS)
                .filter(move |bit| word & (1 << bit) != 0)
                .map(move |bit| n * BITS + bit)
        })
    }
}
