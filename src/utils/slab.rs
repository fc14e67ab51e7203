/// Storage with stable integer keys; freed keys are reused.
pub(crate) struct Slab<T> {
    items: Vec<Option<T>>,
    free: Vec<usize>,
    len: usize,
}

impl<T> Slab<T> {
    pub(crate) fn new() -> Self {
        Self {
            items: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    pub(crate) fn insert(&mut self, item: T) -> usize {
        self.len += 1;

        match self.free.pop() {
            Some(index) => {
                self.items[index] = Some(item);
                index
            }
            None => {
                self.items.push(Some(item));
                self.items.len() - 1
            }
        }
    }

    /// Removes the item under `index`. Unknown or already freed keys are
    /// ignored.
    pub(crate) fn remove(&mut self, index: usize) -> Option<T> {
        let item = self.items.get_mut(index)?.take()?;

        self.free.push(index);
        self.len -= 1;

        Some(item)
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter().flatten()
    }
}

impl<T> Default for Slab<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_reused_after_removal() {
        let mut slab = Slab::new();
        let a = slab.insert("a");
        let b = slab.insert("b");

        assert_eq!(slab.remove(a), Some("a"));
        assert_eq!(slab.remove(a), None);

        let c = slab.insert("c");
        assert_eq!(c, a);
        assert_eq!(slab.len(), 2);

        let mut items: Vec<_> = slab.iter().copied().collect();
        items.sort();
        assert_eq!(items, vec!["b", "c"]);
        assert_eq!(slab.remove(b), Some("b"));
    }

    #[test]
    fn removing_unknown_key_is_ignored() {
        let mut slab: Slab<u8> = Slab::new();
        assert_eq!(slab.remove(3), None);
        assert_eq!(slab.len(), 0);
    }
}
