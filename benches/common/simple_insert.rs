use glam::*;
use tessera::*;

/// Registers a component for `T` under a new entity, allowing several components of one type
pub fn component<T: ComponentValue>(world: &mut World) -> Component<T> {
    let id = world.create();
    let id = world.register_component(id, ComponentDesc::of::<T>()).unwrap();
    Component::from_id(id)
}

pub struct Benchmark;

impl Benchmark {
    pub fn new() -> Self {
        Self
    }

    pub fn run(&mut self) {
        let mut world = World::builder().entity_capacity(10_000).build();
        let transform = world.component::<Mat4>();
        let position = component::<Vec3>(&mut world);
        let rotation = component::<Vec3>(&mut world);
        let velocity = component::<Vec3>(&mut world);

        for _ in 0..10_000 {
            let id = world.create();
            world.set(id, transform, Mat4::from_scale(Vec3::ONE)).unwrap();
            world.set(id, position, Vec3::X).unwrap();
            world.set(id, rotation, Vec3::X).unwrap();
            world.set(id, velocity, Vec3::X).unwrap();
        }
    }
}
