use crate::error::{Error, Result};
use corosensei::stack::DefaultStack;
use std::cell::RefCell;
use std::fmt;

/// Finished tasks return their stack here so the next task a worker starts
/// does not pay for a fresh mapping.
const MAX_CACHED_STACKS: usize = 32;

/// Per-worker cache of task stacks, all of the runtime's call stack size.
pub(crate) struct StackPool {
    size: usize,
    cached: RefCell<Vec<DefaultStack>>,
}

impl StackPool {
    pub(crate) fn new(size: usize) -> Self {
        Self {
            size,
            cached: RefCell::new(Vec::new()),
        }
    }

    pub(crate) fn get(&self) -> Result<DefaultStack> {
        if let Some(stack) = self.cached.borrow_mut().pop() {
            return Ok(stack);
        }

        DefaultStack::new(self.size).map_err(|source| Error::StackAlloc {
            size: self.size,
            source,
        })
    }

    pub(crate) fn put(&self, stack: DefaultStack) {
        let mut cached = self.cached.borrow_mut();
        if cached.len() < MAX_CACHED_STACKS {
            cached.push(stack);
        }
    }

    pub(crate) fn cached(&self) -> usize {
        self.cached.borrow().len()
    }
}

impl fmt::Debug for StackPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackPool")
            .field("size", &self.size)
            .field("cached", &self.cached())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn test_stacks_are_reused() -> Result<()> {
        let pool = StackPool::new(64 * 1024);
        assert_eq!(pool.cached(), 0);

        let stack = pool.get()?;
        pool.put(stack);
        assert_eq!(pool.cached(), 1);

        let _stack = pool.get()?;
        assert_eq!(pool.cached(), 0);
        Ok(())
    }

    #[test]
    fn test_cache_is_bounded() -> Result<()> {
        let pool = StackPool::new(16 * 1024);
        let stacks = (0..MAX_CACHED_STACKS + 4)
            .map(|_| pool.get())
            .collect::<Result<Vec<_>, _>>()?;

        stacks.into_iter().for_each(|s| pool.put(s));
        assert_eq!(pool.cached(), MAX_CACHED_STACKS);
        Ok(())
    }
}
