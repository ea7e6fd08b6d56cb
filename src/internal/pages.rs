//! Page navigation.

use tokio::sync::watch;

/// Current page of the surface grid.
pub trait PageController: Send + Sync {
    /// Current page, starting at 1.
    fn current_page(&self) -> u32;

    /// Number of pages.
    fn page_count(&self) -> u32;

    /// Jump to a page. Out-of-range pages are ignored.
    ///
    /// Returns true when the page changed.
    fn set_page(&self, page: u32) -> bool;

    /// Next page, wrapping from the last to the first.
    fn inc_page(&self) -> bool {
        let page = self.current_page();
        let next = if page >= self.page_count() { 1 } else { page + 1 };
        self.set_page(next)
    }

    /// Previous page, wrapping from the first to the last.
    fn dec_page(&self) -> bool {
        let page = self.current_page();
        let prev = if page <= 1 { self.page_count() } else { page - 1 };
        self.set_page(prev)
    }

    /// Watch page changes.
    fn subscribe(&self) -> watch::Receiver<u32>;
}

/// Page controller over a fixed number of pages.
pub struct SimplePages {
    count: u32,
    current: watch::Sender<u32>,
}

impl SimplePages {
    /// Create a controller starting on page 1. A zero count becomes 1.
    pub fn new(count: u32) -> Self {
        let (current, _) = watch::channel(1);
        Self {
            count: count.max(1),
            current,
        }
    }
}

impl PageController for SimplePages {
    fn current_page(&self) -> u32 {
        *self.current.borrow()
    }

    fn page_count(&self) -> u32 {
        self.count
    }

    fn set_page(&self, page: u32) -> bool {
        if page == 0 || page > self.count {
            return false;
        }
        self.current.send_if_modified(|current| {
            if *current == page {
                false
            } else {
                *current = page;
                true
            }
        })
    }

    fn subscribe(&self) -> watch::Receiver<u32> {
        self.current.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inc_and_dec_wrap() {
        let pages = SimplePages::new(3);
        assert!(pages.inc_page());
        assert!(pages.inc_page());
        assert_eq!(pages.current_page(), 3);
        assert!(pages.inc_page());
        assert_eq!(pages.current_page(), 1);
        assert!(pages.dec_page());
        assert_eq!(pages.current_page(), 3);
    }

    #[test]
    fn test_set_page_bounds() {
        let pages = SimplePages::new(3);
        assert!(!pages.set_page(0));
        assert!(!pages.set_page(4));
        assert!(!pages.set_page(1));
        assert!(pages.set_page(2));
        assert_eq!(pages.current_page(), 2);
    }

    #[test]
    fn test_single_page_never_changes() {
        let pages = SimplePages::new(0);
        assert_eq!(pages.page_count(), 1);
        assert!(!pages.inc_page());
        assert!(!pages.dec_page());
    }

    #[tokio::test]
    async fn test_subscribers_see_changes() {
        let pages = SimplePages::new(5);
        let mut rx = pages.subscribe();
        pages.set_page(4);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 4);
    }
}
