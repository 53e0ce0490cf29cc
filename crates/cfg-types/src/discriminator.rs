/// A single discriminator byte: `None` is the wildcard "this byte does not
/// participate in identity" (spec.md §3).
pub type DiscriminatorByte = Option<u8>;

/// An ordered per-byte identity signature.
///
/// `Discriminator` deliberately does **not** implement `Eq`: its comparison
/// (`a ~ b` iff same length and, for every index, `a[i] == None || b[i] ==
/// None || a[i] == b[i]`) is reflexive and symmetric but **not transitive**
/// (`A ~ B, B ~ C` does not imply `A ~ C` once wildcards are involved) —
/// spec.md §9 Design Notes is explicit that this must never be used as a
/// map key requiring transitivity. Lookups that match a discriminator
/// against a set of candidates must scan a short list (`NodeLinker`,
/// `SelectorNode::successors_per_discriminator`); only a discriminator's
/// *concrete* projection (`Discriminator::final_bytes`, which never
/// contains a wildcard given final fields are always fully specified) is
/// ever hashed.
#[derive(Clone, Debug, Default)]
pub struct Discriminator(Vec<DiscriminatorByte>);

impl Discriminator {
    pub fn new(bytes: Vec<DiscriminatorByte>) -> Self {
        Self(bytes)
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn bytes(&self) -> &[DiscriminatorByte] {
        &self.0
    }

    /// Checks the live bytes at an address against this discriminator,
    /// byte for byte, honoring wildcards. `live` must be the same length as
    /// this discriminator.
    pub fn matches_concrete_bytes(&self, live: &[u8]) -> bool {
        self.0.len() == live.len()
            && self
                .0
                .iter()
                .zip(live.iter())
                .all(|(d, l)| d.map_or(true, |byte| byte == *l))
    }

    /// spec.md §3: "two discriminators compare equal iff same length and
    /// ∀i: a[i]=None ∨ b[i]=None ∨ a[i]=b[i]". Not an `Eq`/`PartialEq` impl
    /// on purpose — see the type's doc comment.
    pub fn compatible_with(&self, other: &Discriminator) -> bool {
        self.0.len() == other.0.len()
            && self
                .0
                .iter()
                .zip(other.0.iter())
                .all(|(a, b)| a.is_none() || b.is_none() || a == b)
    }

    pub fn concat(mut self, mut other: Discriminator) -> Self {
        self.0.append(&mut other.0);
        self
    }
}

impl FromIterator<DiscriminatorByte> for Discriminator {
    fn from_iter<T: IntoIterator<Item = DiscriminatorByte>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
