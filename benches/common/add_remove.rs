use tessera::*;

pub struct Benchmark {
    world: World,
    ids: Vec<Entity>,
    b: Component<f64>,
}

impl Benchmark {
    pub fn new() -> Self {
        let mut world = World::default();
        let a = world.component::<f32>();
        let b = world.component::<f64>();

        let ids = (0..10_000)
            .map(|_| {
                let id = world.create();
                world.set(id, a, 0.0).unwrap();
                id
            })
            .collect();

        Self { world, ids, b }
    }

    pub fn run(&mut self) {
        for &id in &self.ids {
            self.world.set(id, self.b, 0.0).unwrap();
        }

        for &id in &self.ids {
            self.world.remove(id, self.b).unwrap();
        }
    }
}
