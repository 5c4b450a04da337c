use serde::{Deserialize, Serialize};

/// Distance metric an index is built with. Determines both the distance
/// formula (§4.4.1) and the sort direction of search results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Metric {
    L2,
    InnerProduct,
    Cosine,
}

impl Metric {
    /// L2 results are sorted ascending (closer is smaller); inner product
    /// and cosine are sorted descending (more similar is larger).
    pub fn ascending(self) -> bool {
        matches!(self, Metric::L2)
    }

    /// Orders two `(distance, position)` pairs the way this metric wants
    /// results merged: correct direction first, then stable tie-break by
    /// position.
    pub fn cmp_results(self, a: (f32, u32), b: (f32, u32)) -> std::cmp::Ordering {
        let ord = a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal);
        let ord = if self.ascending() { ord } else { ord.reverse() };
        ord.then_with(|| a.1.cmp(&b.1))
    }
}
