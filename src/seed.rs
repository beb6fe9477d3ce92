//! Example records inserted once into an empty journal.

use crate::remote::types::{Identity, NewMemory};

/// The fixed example set, oldest first so they land in a natural order.
pub fn examples() -> Vec<NewMemory> {
  vec![
    NewMemory::new(
      Identity::A,
      "Our first entry. Write anything here: a small moment, a photo, a note for later.",
    )
    .with_created_at(1_704_103_200_000)
    .with_tag("welcome"),
    NewMemory::new(
      Identity::B,
      "Entries from both of us show up here, newest first.",
    )
    .with_created_at(1_704_106_800_000)
    .with_tag("welcome"),
    NewMemory::new(
      Identity::A,
      "Tap an entry to edit it, or delete these examples once you have your own.",
    )
    .with_created_at(1_704_110_400_000),
  ]
}
