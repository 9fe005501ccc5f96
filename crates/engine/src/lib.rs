pub mod artifact;
pub mod block;
pub mod reconcile;
pub mod stage;

pub use artifact::*;
pub use block::*;
pub use reconcile::*;
pub use stage::*;
