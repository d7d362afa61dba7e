// ── Concierge Atoms ────────────────────────────────────────────────────────
// Pure data types and the canonical error enum.
// Atoms layer rule: no I/O, no side effects, no imports from engine/.

pub mod error;
pub mod types;
