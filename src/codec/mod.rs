//! Symbol buffers and the codec chain.
//!
//! Demodulated symbols accumulate in a [`SymBuf`]; listeners plugged
//! into it are fed every append through `on_data` and told about
//! detachment through `on_eos`. Codecs transform symbol streams and are
//! looked up by name in a process-lifetime [`CodecRegistry`] populated
//! at startup.

mod diff;

use crate::config::Config;

pub use self::diff::{
    DiffCodec,
    register_builtin_codecs,
};

/// One demodulated symbol, as raw bits.
pub type Symbol = u8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("no such codec class: {0:?}")]
    NoSuchClass(&'static str),
    #[error("codec cannot run in this direction")]
    BadDirection,
    #[error("invalid codec configuration")]
    BadConfig,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodecDirection {
    Forwards,
    Backwards,
}

/// A plugged consumer of a [`SymBuf`]. `on_data` returns how many
/// symbols it consumed; its read cursor advances by that amount.
pub trait SymBufListener: Send {
    fn on_data(&mut self, data: &[Symbol]) -> usize;

    fn on_eos(&mut self) {}
}

pub type ListenerId = usize;

struct PluggedListener {
    id: ListenerId,
    cursor: usize,
    listener: Box<dyn SymBufListener>,
}

/// Growable symbol sequence with attached listeners.
#[derive(Default)]
pub struct SymBuf {
    symbols: Vec<Symbol>,
    listeners: Vec<PluggedListener>,
    next_id: ListenerId,
}

impl SymBuf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn as_slice(&self) -> &[Symbol] {
        &self.symbols
    }

    pub fn plug(&mut self, listener: Box<dyn SymBufListener>) -> ListenerId {
        let id = self.next_id;
        self.next_id += 1;
        self.listeners.push(PluggedListener {
            id,
            cursor: self.symbols.len(),
            listener,
        });
        id
    }

    /// Detach a listener, invoking its `on_eos`.
    pub fn unplug(&mut self, id: ListenerId) -> bool {
        let Some(index) = self.listeners.iter().position(|entry| entry.id == id) else {
            return false;
        };
        let mut entry = self.listeners.swap_remove(index);
        entry.listener.on_eos();
        true
    }

    /// Append symbols and feed every listener the data beyond its
    /// cursor.
    pub fn append(&mut self, symbols: &[Symbol]) {
        self.symbols.extend_from_slice(symbols);

        for entry in &mut self.listeners {
            let fresh = &self.symbols[entry.cursor..];
            if fresh.is_empty() {
                continue;
            }
            let consumed = entry.listener.on_data(fresh).min(fresh.len());
            entry.cursor += consumed;
        }
    }
}

/// A symbol-stream transformer. `process` appends its output to `out`
/// and returns how many input symbols it consumed.
pub trait Codec: Send {
    fn config(&self) -> &Config;

    fn output_bits_per_symbol(&self) -> u32;

    fn process(&mut self, input: &[Symbol], out: &mut Vec<Symbol>) -> Result<usize, Error>;
}

type CodecCtor =
    fn(bits_per_symbol: u32, direction: CodecDirection, config: &Config)
        -> Result<Box<dyn Codec>, Error>;

pub struct CodecClass {
    pub name: &'static str,
    pub description: &'static str,
    /// configuration schema presented to clients
    pub config_template: fn() -> Config,
    pub ctor: CodecCtor,
}

/// Registry of codec classes. Registration is append-only and happens
/// before worker threads start.
#[derive(Default)]
pub struct CodecRegistry {
    classes: Vec<CodecClass>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the builtin codecs already registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        register_builtin_codecs(&mut registry);
        registry
    }

    pub fn register(&mut self, class: CodecClass) {
        self.classes.push(class);
    }

    pub fn lookup(&self, name: &str) -> Option<&CodecClass> {
        self.classes.iter().find(|class| class.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.classes.iter().map(|class| class.name)
    }

    pub fn make(
        &self,
        name: &'static str,
        bits_per_symbol: u32,
        direction: CodecDirection,
        config: &Config,
    ) -> Result<Box<dyn Codec>, Error> {
        let class = self.lookup(name).ok_or(Error::NoSuchClass(name))?;
        (class.ctor)(bits_per_symbol, direction, config)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        Mutex,
    };

    use super::*;

    struct Recorder {
        seen: Arc<Mutex<Vec<Symbol>>>,
        eos: Arc<Mutex<bool>>,
        /// consume at most this many symbols per call
        budget: usize,
    }

    impl SymBufListener for Recorder {
        fn on_data(&mut self, data: &[Symbol]) -> usize {
            let take = data.len().min(self.budget);
            self.seen.lock().unwrap().extend_from_slice(&data[..take]);
            take
        }

        fn on_eos(&mut self) {
            *self.eos.lock().unwrap() = true;
        }
    }

    #[test]
    fn listeners_see_appends_past_their_cursor() {
        let mut symbuf = SymBuf::new();
        symbuf.append(&[1, 2, 3]);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let eos = Arc::new(Mutex::new(false));
        let id = symbuf.plug(Box::new(Recorder {
            seen: seen.clone(),
            eos: eos.clone(),
            budget: usize::MAX,
        }));

        // plugged after the first batch: only new data flows
        symbuf.append(&[4, 5]);
        assert_eq!(*seen.lock().unwrap(), vec![4, 5]);

        assert!(symbuf.unplug(id));
        assert!(*eos.lock().unwrap());
        assert!(!symbuf.unplug(id));
    }

    #[test]
    fn partial_consumption_resumes_at_cursor() {
        let mut symbuf = SymBuf::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let eos = Arc::new(Mutex::new(false));
        symbuf.plug(Box::new(Recorder {
            seen: seen.clone(),
            eos,
            budget: 2,
        }));

        symbuf.append(&[10, 11, 12]);
        assert_eq!(*seen.lock().unwrap(), vec![10, 11]);

        // the unconsumed tail is offered again together with new data
        symbuf.append(&[13]);
        assert_eq!(*seen.lock().unwrap(), vec![10, 11, 12, 13]);
    }

    #[test]
    fn registry_looks_up_builtins() {
        let registry = CodecRegistry::with_builtins();
        assert!(registry.lookup("diff").is_some());
        assert!(registry.lookup("pi-m-psk").is_some());
        assert!(registry.lookup("missing").is_none());
    }
}
