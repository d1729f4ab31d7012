mod index;
mod inspect;
mod r#match;

pub use index::*;
pub use inspect::*;
pub use r#match::*;

use crate::config::Opts;

pub trait SubCommandExtend {
    fn run(&self, opts: &Opts) -> anyhow::Result<()>;
}
