//! Caching implementations for journal types.

use crate::cache::Cacheable;

use super::types::MemoryRecord;

impl Cacheable for MemoryRecord {
  fn cache_key(&self) -> String {
    self.id.clone()
  }

  fn entity_type() -> &'static str {
    "memory"
  }
}
