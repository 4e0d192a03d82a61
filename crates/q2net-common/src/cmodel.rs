// cmodel.rs -- collision queries used by player movement
//
// The map's BSP collision model lives outside this crate; movement only
// needs point contents and box sweeps, so both sides talk to it through
// `CollisionModel`. `BoxWorld` implements it for worlds made of axis-aligned
// brushes, which is what the dedicated server and tests run on.

use crate::q_shared::{
    decode_solid, dot_product, CPlane, Trace, Vec3, CONTENTS_MONSTER, CONTENTS_SOLID,
};

/// Encoded `solid` value of entities that use an inline brush model.
pub const SOLID_BMODEL: i32 = 31;

/// Keeps trace endpoints off brush faces.
const DIST_EPSILON: f32 = 0.03125;

pub trait CollisionModel {
    /// Contents bits of everything that contains `point`.
    fn point_contents(&self, point: &Vec3) -> i32;

    /// Sweep a box from `start` to `end` against everything whose contents
    /// intersect `content_mask`, skipping entity `passent`.
    fn box_trace(
        &self,
        start: &Vec3,
        end: &Vec3,
        mins: &Vec3,
        maxs: &Vec3,
        passent: i32,
        content_mask: i32,
    ) -> Trace;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoxBrush {
    pub mins: Vec3,
    pub maxs: Vec3,
    pub contents: i32,
    /// 0 for world geometry, otherwise the entity the box belongs to.
    pub entity: i32,
}

impl BoxBrush {
    fn planes(&self) -> [CPlane; 6] {
        let (mn, mx) = (self.mins, self.maxs);
        [
            CPlane { normal: [1.0, 0.0, 0.0], dist: mx[0] },
            CPlane { normal: [-1.0, 0.0, 0.0], dist: -mn[0] },
            CPlane { normal: [0.0, 1.0, 0.0], dist: mx[1] },
            CPlane { normal: [0.0, -1.0, 0.0], dist: -mn[1] },
            CPlane { normal: [0.0, 0.0, 1.0], dist: mx[2] },
            CPlane { normal: [0.0, 0.0, -1.0], dist: -mn[2] },
        ]
    }

    /// Box around an entity at `origin`.
    pub fn for_entity(number: i32, origin: &Vec3, mins: &Vec3, maxs: &Vec3, contents: i32) -> Self {
        Self {
            mins: [origin[0] + mins[0], origin[1] + mins[1], origin[2] + mins[2]],
            maxs: [origin[0] + maxs[0], origin[1] + maxs[1], origin[2] + maxs[2]],
            contents,
            entity: number,
        }
    }

    pub fn contains(&self, p: &Vec3) -> bool {
        (0..3).all(|i| p[i] >= self.mins[i] && p[i] <= self.maxs[i])
    }
}

/// Plane distance pushed out by the moving box's extents.
fn expanded_dist(plane: &CPlane, mins: &Vec3, maxs: &Vec3) -> f32 {
    let mut ofs = [0.0f32; 3];
    for j in 0..3 {
        ofs[j] = if plane.normal[j] < 0.0 { maxs[j] } else { mins[j] };
    }
    plane.dist - dot_product(&ofs, &plane.normal)
}

fn clip_box_to_brush(mins: &Vec3, maxs: &Vec3, p1: &Vec3, p2: &Vec3, trace: &mut Trace, brush: &BoxBrush) {
    let mut enterfrac: f32 = -1.0;
    let mut leavefrac: f32 = 1.0;
    let mut clipplane = None;
    let mut getout = false;
    let mut startout = false;

    for plane in brush.planes() {
        let dist = expanded_dist(&plane, mins, maxs);
        let d1 = dot_product(p1, &plane.normal) - dist;
        let d2 = dot_product(p2, &plane.normal) - dist;

        if d2 > 0.0 {
            getout = true;
        }
        if d1 > 0.0 {
            startout = true;
        }

        // completely in front of this face
        if d1 > 0.0 && d2 >= d1 {
            return;
        }
        if d1 <= 0.0 && d2 <= 0.0 {
            continue;
        }

        if d1 > d2 {
            let f = (d1 - DIST_EPSILON) / (d1 - d2);
            if f > enterfrac {
                enterfrac = f;
                clipplane = Some(plane);
            }
        } else {
            let f = (d1 + DIST_EPSILON) / (d1 - d2);
            if f < leavefrac {
                leavefrac = f;
            }
        }
    }

    if !startout {
        trace.startsolid = true;
        if !getout {
            trace.allsolid = true;
        }
        trace.contents = brush.contents;
        trace.ent_index = brush.entity;
        return;
    }

    if enterfrac < leavefrac && enterfrac > -1.0 && enterfrac < trace.fraction {
        trace.fraction = enterfrac.max(0.0);
        if let Some(plane) = clipplane {
            trace.plane = plane;
        }
        trace.contents = brush.contents;
        trace.ent_index = brush.entity;
    }
}

fn test_box_in_brush(mins: &Vec3, maxs: &Vec3, p1: &Vec3, trace: &mut Trace, brush: &BoxBrush) {
    for plane in brush.planes() {
        let dist = expanded_dist(&plane, mins, maxs);
        if dot_product(p1, &plane.normal) - dist > 0.0 {
            return;
        }
    }

    trace.startsolid = true;
    trace.allsolid = true;
    trace.fraction = 0.0;
    trace.contents = brush.contents;
    trace.ent_index = brush.entity;
}

/// A world of axis-aligned solid boxes. World brushes stay put; entity
/// boxes are replaced as entities move.
#[derive(Debug, Clone, Default)]
pub struct BoxWorld {
    brushes: Vec<BoxBrush>,
    entities: Vec<BoxBrush>,
}

impl BoxWorld {
    pub fn new() -> Self {
        Self::default()
    }

    /// A flat solid floor whose top is at height `z`.
    pub fn with_floor(z: f32) -> Self {
        let mut world = Self::new();
        world.add_brush([-4096.0, -4096.0, -4096.0], [4096.0, 4096.0, z], CONTENTS_SOLID);
        world
    }

    pub fn add_brush(&mut self, mins: Vec3, maxs: Vec3, contents: i32) -> &mut Self {
        self.brushes.push(BoxBrush {
            mins,
            maxs,
            contents,
            entity: 0,
        });
        self
    }

    /// Add a box for entity `number` at `origin` with the given extents.
    pub fn add_entity_box(&mut self, number: i32, origin: &Vec3, mins: &Vec3, maxs: &Vec3, contents: i32) {
        self.entities
            .push(BoxBrush::for_entity(number, origin, mins, maxs, contents));
    }

    pub fn clear_entities(&mut self) {
        self.entities.clear();
    }

    pub fn brushes(&self) -> impl Iterator<Item = &BoxBrush> {
        self.brushes.iter().chain(self.entities.iter())
    }
}

impl CollisionModel for BoxWorld {
    fn point_contents(&self, point: &Vec3) -> i32 {
        self.brushes()
            .filter(|b| b.contains(point))
            .fold(0, |acc, b| acc | b.contents)
    }

    fn box_trace(
        &self,
        start: &Vec3,
        end: &Vec3,
        mins: &Vec3,
        maxs: &Vec3,
        passent: i32,
        content_mask: i32,
    ) -> Trace {
        trace_brushes(self.brushes(), start, end, mins, maxs, passent, content_mask)
    }
}

/// Sweep a box through a set of brushes. With `start == end` this is a
/// position test.
pub fn trace_brushes<'a>(
    brushes: impl IntoIterator<Item = &'a BoxBrush>,
    start: &Vec3,
    end: &Vec3,
    mins: &Vec3,
    maxs: &Vec3,
    passent: i32,
    content_mask: i32,
) -> Trace {
    let mut trace = Trace {
        fraction: 1.0,
        ..Default::default()
    };

    let position_test = start == end;
    for brush in brushes {
        if brush.contents & content_mask == 0 || (brush.entity != 0 && brush.entity == passent) {
            continue;
        }
        if position_test {
            test_box_in_brush(mins, maxs, start, &mut trace, brush);
        } else {
            clip_box_to_brush(mins, maxs, start, end, &mut trace, brush);
        }
        if trace.allsolid {
            trace.fraction = 0.0;
            break;
        }
    }

    if trace.fraction == 1.0 {
        trace.endpos = *end;
    } else {
        for i in 0..3 {
            trace.endpos[i] = start[i] + trace.fraction * (end[i] - start[i]);
        }
    }
    trace
}

/// A collision model plus the bounding boxes of solid entities. Movement
/// on both ends traces through this so the server and a predicting client
/// clip against the same boxes.
pub struct EntityClipWorld<'a, W: CollisionModel + ?Sized> {
    world: &'a W,
    boxes: Vec<BoxBrush>,
}

impl<'a, W: CollisionModel + ?Sized> EntityClipWorld<'a, W> {
    pub fn new(world: &'a W) -> Self {
        Self {
            world,
            boxes: Vec::new(),
        }
    }

    /// Add entity `number` using its encoded `solid` size. Brush models
    /// (`SOLID_BMODEL`) need the map's inline models and are skipped.
    pub fn add_entity(&mut self, number: i32, origin: &Vec3, solid: i32) {
        if solid == 0 || solid == SOLID_BMODEL {
            return;
        }
        let (mins, maxs) = decode_solid(solid);
        self.boxes
            .push(BoxBrush::for_entity(number, origin, &mins, &maxs, CONTENTS_MONSTER));
    }

    pub fn len(&self) -> usize {
        self.boxes.len()
    }
}

impl<W: CollisionModel + ?Sized> CollisionModel for EntityClipWorld<'_, W> {
    fn point_contents(&self, point: &Vec3) -> i32 {
        self.boxes
            .iter()
            .filter(|b| b.contains(point))
            .fold(self.world.point_contents(point), |acc, b| acc | b.contents)
    }

    fn box_trace(
        &self,
        start: &Vec3,
        end: &Vec3,
        mins: &Vec3,
        maxs: &Vec3,
        passent: i32,
        content_mask: i32,
    ) -> Trace {
        let mut t = self.world.box_trace(start, end, mins, maxs, passent, content_mask);
        if t.allsolid || self.boxes.is_empty() {
            return t;
        }

        let et = trace_brushes(&self.boxes, start, end, mins, maxs, passent, content_mask);
        if et.allsolid || et.startsolid || et.fraction < t.fraction {
            let startsolid = t.startsolid;
            t = et;
            t.startsolid |= startsolid;
        } else if et.startsolid {
            t.startsolid = true;
        }
        t
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::q_shared::{CONTENTS_WATER, MASK_PLAYERSOLID};

    const MINS: Vec3 = [-16.0, -16.0, -24.0];
    const MAXS: Vec3 = [16.0, 16.0, 32.0];

    #[test]
    fn test_trace_open_air() {
        let world = BoxWorld::new();
        let t = world.box_trace(&[0.0; 3], &[100.0, 0.0, 0.0], &MINS, &MAXS, -1, MASK_PLAYERSOLID);
        assert_eq!(t.fraction, 1.0);
        assert_eq!(t.endpos, [100.0, 0.0, 0.0]);
        assert_eq!(t.ent_index, -1);
    }

    #[test]
    fn test_trace_hits_floor() {
        let world = BoxWorld::with_floor(0.0);
        let t = world.box_trace(&[0.0, 0.0, 100.0], &[0.0, 0.0, 0.0], &MINS, &MAXS, -1, MASK_PLAYERSOLID);
        assert!(t.fraction < 1.0);
        assert_eq!(t.plane.normal, [0.0, 0.0, 1.0]);
        assert_eq!(t.ent_index, 0);
        // stops just above the point where the feet touch
        assert!(t.endpos[2] > 24.0 && t.endpos[2] < 24.1, "endpos {:?}", t.endpos);
    }

    #[test]
    fn test_trace_slides_along_floor() {
        let world = BoxWorld::with_floor(0.0);
        let t = world.box_trace(&[0.0, 0.0, 24.125], &[64.0, 0.0, 24.125], &MINS, &MAXS, -1, MASK_PLAYERSOLID);
        assert_eq!(t.fraction, 1.0);
        assert!(!t.startsolid);
    }

    #[test]
    fn test_position_test() {
        let world = BoxWorld::with_floor(0.0);
        let inside = world.box_trace(&[0.0, 0.0, 10.0], &[0.0, 0.0, 10.0], &MINS, &MAXS, -1, MASK_PLAYERSOLID);
        assert!(inside.allsolid);
        assert_eq!(inside.fraction, 0.0);

        let clear = world.box_trace(&[0.0, 0.0, 24.125], &[0.0, 0.0, 24.125], &MINS, &MAXS, -1, MASK_PLAYERSOLID);
        assert!(!clear.allsolid);
    }

    #[test]
    fn test_entity_boxes() {
        let mut world = BoxWorld::new();
        world.add_entity_box(5, &[64.0, 0.0, 0.0], &MINS, &MAXS, CONTENTS_SOLID);

        let t = world.box_trace(&[0.0; 3], &[128.0, 0.0, 0.0], &MINS, &MAXS, -1, MASK_PLAYERSOLID);
        assert_eq!(t.ent_index, 5);
        assert_eq!(t.plane.normal, [-1.0, 0.0, 0.0]);

        let t = world.box_trace(&[0.0; 3], &[128.0, 0.0, 0.0], &MINS, &MAXS, 5, MASK_PLAYERSOLID);
        assert_eq!(t.fraction, 1.0);

        world.clear_entities();
        assert_eq!(world.brushes().count(), 0);
    }

    #[test]
    fn test_point_contents() {
        let mut world = BoxWorld::with_floor(0.0);
        world.add_brush([0.0, 0.0, 0.0], [64.0, 64.0, 64.0], CONTENTS_WATER);
        assert_eq!(world.point_contents(&[10.0, 10.0, 10.0]), CONTENTS_WATER);
        assert_eq!(world.point_contents(&[10.0, 10.0, -10.0]), CONTENTS_SOLID);
        assert_eq!(world.point_contents(&[-10.0, 10.0, 10.0]), 0);
        // water is not in the player solid mask
        let t = world.box_trace(&[32.0, 32.0, 100.0], &[32.0, 32.0, 40.0], &MINS, &MAXS, -1, MASK_PLAYERSOLID);
        assert_eq!(t.fraction, 1.0);
    }

    #[test]
    fn test_entity_clip_world() {
        let floor = BoxWorld::with_floor(0.0);
        let mut world = EntityClipWorld::new(&floor);
        let solid = crate::q_shared::encode_solid(&MINS, &MAXS);
        world.add_entity(1, &[0.0, 0.0, 24.125], solid);
        world.add_entity(2, &[64.0, 0.0, 24.125], solid);
        world.add_entity(3, &[0.0, 0.0, 0.0], SOLID_BMODEL);
        assert_eq!(world.len(), 2);

        // entity 1 is the mover itself
        let t = world.box_trace(&[0.0, 0.0, 24.125], &[128.0, 0.0, 24.125], &MINS, &MAXS, 1, MASK_PLAYERSOLID);
        assert_eq!(t.ent_index, 2);
        assert!(t.endpos[0] > 31.9 && t.endpos[0] < 32.0);
        assert!(!t.startsolid);

        let t = world.box_trace(&[0.0, 0.0, 100.0], &[0.0, 0.0, 0.0], &MINS, &MAXS, 2, MASK_PLAYERSOLID);
        assert_eq!(t.ent_index, 1);
        assert_eq!(world.point_contents(&[64.0, 0.0, 24.0]), CONTENTS_MONSTER);
    }
}
