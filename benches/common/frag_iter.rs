use tessera::*;

use super::simple_insert::component;

/// 26 tables of 20 entities, all sharing `data`
pub struct Benchmark(World, Query);

impl Benchmark {
    pub fn new() -> Self {
        let mut world = World::default();
        let data = world.component::<f32>();

        for _ in 0..26 {
            let variant = component::<f32>(&mut world);
            for _ in 0..20 {
                let id = world.create();
                world.set(id, variant, 0.0).unwrap();
                world.set(id, data, 0.0).unwrap();
            }
        }

        let query = Query::builder().with_mut(data).build(&world).unwrap();
        Self(world, query)
    }

    pub fn run(&mut self) {
        for batch in self.1.iter(&self.0) {
            for data in batch.field_mut::<f32>(0).unwrap().iter_mut() {
                *data *= 2.0;
            }
        }
    }
}
