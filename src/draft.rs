//! Copy-on-write drafting for mutation-style reducers.
//!
//! Reducers registered with [`Wiring::mutator`] write through a mutable draft
//! instead of returning a new state value. The draft starts as a clone of the
//! current state; the original is never touched, so state values stay
//! immutable from the outside even when handler bodies look imperative.
//!
//! [`Wiring::mutator`]: crate::Wiring::mutator

/// Produce a new value by mutating a clone of `state`.
///
/// # Example
///
/// ```
/// let base = vec![1, 2];
/// let next = switchboard::revise(&base, |draft| draft.push(3));
///
/// assert_eq!(base, vec![1, 2]);
/// assert_eq!(next, vec![1, 2, 3]);
/// ```
pub fn revise<S: Clone>(state: &S, mutate: impl FnOnce(&mut S)) -> S {
    let mut draft = state.clone();
    mutate(&mut draft);
    draft
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct Cart {
        items: Vec<String>,
        total: u32,
    }

    #[test]
    fn test_revise_leaves_original_untouched() {
        let before = Cart {
            items: vec!["apple".into()],
            total: 3,
        };

        let after = revise(&before, |draft| {
            draft.items.push("pear".into());
            draft.total += 2;
        });

        assert_eq!(before.items, vec!["apple".to_string()]);
        assert_eq!(before.total, 3);
        assert_eq!(after.items.len(), 2);
        assert_eq!(after.total, 5);
    }

    #[test]
    fn test_revise_identity_when_mutation_is_noop() {
        let before = Cart {
            items: vec![],
            total: 0,
        };
        let after = revise(&before, |_| {});

        assert_eq!(before, after);
    }
}
