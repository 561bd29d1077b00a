use std::collections::{HashMap, HashSet, VecDeque};

use enostr::Pubkey;

/// Decides whether an author's notes may be shown at all. Injected into
/// the visibility pipeline; the engine never scores trust itself.
pub trait TrustPredicate: Send + Sync {
    fn is_trusted(&self, pubkey: &Pubkey) -> bool;
}

impl<F> TrustPredicate for F
where
    F: Fn(&Pubkey) -> bool + Send + Sync,
{
    fn is_trusted(&self, pubkey: &Pubkey) -> bool {
        self(pubkey)
    }
}

/// Trusts everyone
#[derive(Debug, Default, Clone, Copy)]
pub struct TrustAll;

impl TrustPredicate for TrustAll {
    fn is_trusted(&self, _pubkey: &Pubkey) -> bool {
        true
    }
}

/// Configuration for computing a web-of-trust graph.
/// `max_depth` counts hops away from the root (0 = root, 1 = direct follows).
#[derive(Clone, Copy, Debug)]
pub struct WebOfTrustConfig {
    pub max_depth: u8,
    pub include_self: bool,
}

impl Default for WebOfTrustConfig {
    fn default() -> Self {
        Self {
            max_depth: 2,
            include_self: true,
        }
    }
}

/// Everyone reachable from `root` through contact lists
#[derive(Debug, Clone)]
pub struct WebOfTrust {
    root: Pubkey,
    config: WebOfTrustConfig,
    trusted: HashSet<Pubkey>,
}

impl WebOfTrust {
    /// Breadth-first walk over contact lists. `contacts` is asked at most
    /// once per pubkey and returns the follows of that pubkey, if known.
    pub fn build<F>(root: Pubkey, config: WebOfTrustConfig, mut contacts: F) -> Self
    where
        F: FnMut(&Pubkey) -> Vec<Pubkey>,
    {
        let mut visited: HashSet<Pubkey> = HashSet::new();
        let mut queue: VecDeque<(Pubkey, u8)> = VecDeque::new();
        let mut cache: HashMap<Pubkey, Vec<Pubkey>> = HashMap::new();

        visited.insert(root);
        queue.push_back((root, 0));

        while let Some((current, depth)) = queue.pop_front() {
            if depth >= config.max_depth {
                continue;
            }

            let follows = cache
                .entry(current)
                .or_insert_with(|| contacts(&current))
                .clone();

            for contact in follows {
                if visited.insert(contact) {
                    queue.push_back((contact, depth + 1));
                }
            }
        }

        if !config.include_self {
            visited.remove(&root);
        }

        Self {
            root,
            config,
            trusted: visited,
        }
    }

    pub fn root(&self) -> &Pubkey {
        &self.root
    }

    pub fn config(&self) -> WebOfTrustConfig {
        self.config
    }

    pub fn contains(&self, candidate: &Pubkey) -> bool {
        self.trusted.contains(candidate)
    }

    pub fn len(&self) -> usize {
        self.trusted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trusted.is_empty()
    }
}

impl TrustPredicate for WebOfTrust {
    fn is_trusted(&self, pubkey: &Pubkey) -> bool {
        self.contains(pubkey)
    }
}
