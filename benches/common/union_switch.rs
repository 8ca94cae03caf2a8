use tessera::*;

/// Switches the target of a union relationship, which never moves the entity
pub struct Benchmark {
    world: World,
    ids: Vec<Entity>,
    state: Entity,
    targets: [Entity; 2],
}

impl Benchmark {
    pub fn new() -> Self {
        let mut world = World::default();
        let state = world.create();
        world.set_traits(state, IdTraits::UNION).unwrap();
        let targets = [world.create(), world.create()];

        let ids = (0..10_000)
            .map(|_| {
                let id = world.create();
                world.add(id, Id::pair(state, targets[0])).unwrap();
                id
            })
            .collect();

        Self {
            world,
            ids,
            state,
            targets,
        }
    }

    pub fn run(&mut self) {
        for target in self.targets {
            for &id in &self.ids {
                self.world.add(id, Id::pair(self.state, target)).unwrap();
            }
        }
    }
}
