/// A doubly linked recency list over arena indices, for the purposes
/// of backing the cache's LRU eviction.
///
/// The head is the most recently used index. Links are stored by
/// index, so an entry can be promoted or removed from the middle in
/// constant time without any pointers.
#[derive(Debug, Default)]
pub(crate) struct Lru {
    links: Vec<Link>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

#[derive(Debug, Default, Clone, Copy)]
struct Link {
    linked: bool,
    // towards the head
    newer: Option<usize>,
    // towards the tail
    older: Option<usize>,
}

impl Lru {
    pub(crate) const fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn contains(&self, idx: usize) -> bool {
        self.links.get(idx).map(|l| l.linked).unwrap_or(false)
    }

    /// Marks `idx` as the most recently used, inserting it if needed.
    pub(crate) fn touch(&mut self, idx: usize) {
        if self.contains(idx) {
            if self.head == Some(idx) {
                return;
            }
            self.unwire(idx);
        } else if self.links.len() <= idx {
            self.links.resize(idx + 1, Link::default());
        }

        self.links[idx] = Link { linked: true, newer: None, older: self.head };
        if let Some(old_head) = self.head {
            self.links[old_head].newer = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
        self.len += 1;
    }

    pub(crate) fn remove(&mut self, idx: usize) {
        if self.contains(idx) {
            self.unwire(idx);
        }
    }

    fn unwire(&mut self, idx: usize) {
        let Link { newer, older, .. } = self.links[idx];

        match newer {
            Some(newer) => self.links[newer].older = older,
            None => self.head = older,
        }
        match older {
            Some(older) => self.links[older].newer = newer,
            None => self.tail = newer,
        }

        self.links[idx] = Link::default();
        self.len -= 1;
    }

    /// Iterates from the least recently used index towards the most
    /// recently used one.
    pub(crate) fn iter_lru(&self) -> impl Iterator<Item = usize> + '_ {
        let mut cursor = self.tail;
        std::iter::from_fn(move || {
            let idx = cursor?;
            cursor = self.links[idx].newer;
            Some(idx)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touched_entries_move_to_the_head() {
        let mut lru = Lru::default();
        for idx in [3, 0, 7] {
            lru.touch(idx);
        }
        assert_eq!(lru.iter_lru().collect::<Vec<_>>(), vec![3, 0, 7]);

        lru.touch(3);
        assert_eq!(lru.iter_lru().collect::<Vec<_>>(), vec![0, 7, 3]);

        lru.touch(3);
        assert_eq!(lru.len(), 3);
    }

    #[test]
    fn removal_from_the_middle() {
        let mut lru = Lru::default();
        for idx in 0..5 {
            lru.touch(idx);
        }
        lru.remove(2);
        lru.remove(0);
        lru.remove(4);
        lru.remove(4);
        assert_eq!(lru.iter_lru().collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(lru.len(), 2);
        assert!(!lru.contains(2));

        lru.remove(1);
        lru.remove(3);
        assert_eq!(lru.iter_lru().next(), None);
        lru.touch(9);
        assert_eq!(lru.iter_lru().collect::<Vec<_>>(), vec![9]);
    }
}
