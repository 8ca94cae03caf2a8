use tessera::*;

/// Records structural changes into every stage and merges them
pub struct Benchmark {
    world: World,
    ids: Vec<Entity>,
    value: Component<u64>,
    tag: Entity,
}

impl Benchmark {
    pub fn new() -> Self {
        let mut world = World::builder().stages(4).build();
        let value = world.component::<u64>();
        let tag = world.create();
        let ids = (0..10_000).map(|_| world.create()).collect();

        Self {
            world,
            ids,
            value,
            tag,
        }
    }

    pub fn run(&mut self) {
        self.world.readonly_begin();
        for (i, &id) in self.ids.iter().enumerate() {
            let stage = self.world.stage(i % 4);
            stage.set(id, self.value, i as u64).unwrap();
            stage.add(id, self.tag);
        }

        self.world.readonly_end().unwrap();

        self.world.begin_defer();
        for &id in &self.ids {
            self.world.clear(id).unwrap();
        }

        self.world.end_defer().unwrap();
    }
}
