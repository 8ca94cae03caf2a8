use glam::*;
use tessera::*;

use super::simple_insert::component;

pub struct Benchmark(World, Query);

impl Benchmark {
    pub fn new() -> Self {
        let mut world = World::new();
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

        let query = Query::builder()
            .with(velocity)
            .with_mut(position)
            .build(&world)
            .unwrap();

        Self(world, query)
    }

    pub fn run(&mut self) {
        for batch in self.1.iter(&self.0) {
            let velocity = batch.field::<Vec3>(0).unwrap();
            let mut position = batch.field_mut::<Vec3>(1).unwrap();
            for (pos, vel) in position.iter_mut().zip(velocity.iter()) {
                *pos += *vel;
            }
        }
    }
}
