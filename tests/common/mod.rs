use tracing_subscriber::{prelude::*, EnvFilter};
use tracing_tree::HierarchicalLayer;

#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Position(pub glam::Vec2);

#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Velocity(pub glam::Vec2);

#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(HierarchicalLayer::default().with_indent_lines(true))
        .try_init();
}
