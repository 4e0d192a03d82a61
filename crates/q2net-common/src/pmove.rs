// pmove.rs -- player movement
//
// Shared by the server, which moves players authoritatively, and the client,
// which replays its unacknowledged commands through the same code. Both
// sides must produce bit-identical results from identical inputs, so the
// movement depends only on the PmoveState, the command and the world.

use crate::cmodel::CollisionModel;
use crate::q_shared::{
    angle_vectors, cross_product, dot_product, short2angle, vector_length, vector_normalize,
    vector_scale, CPlane, PmType, PmoveData, Trace, Vec3, CONTENTS_SLIME, CONTENTS_WATER,
    MASK_PLAYERSOLID, MASK_WATER, MAXTOUCH, MAX_CLIP_PLANES, PITCH, PMF_DUCKED, PMF_JUMP_HELD,
    PMF_ON_GROUND, PMF_TIME_LAND, PMF_TIME_TELEPORT, VEC3_ORIGIN, YAW,
};

const STEPSIZE: f32 = 18.0;
const STOP_EPSILON: f32 = 0.1;
const MIN_STEP_NORMAL: f32 = 0.7;

const PM_STOPSPEED: f32 = 100.0;
const PM_MAXSPEED: f32 = 300.0;
const PM_DUCKSPEED: f32 = 100.0;
const PM_ACCELERATE: f32 = 10.0;
const PM_WATERACCELERATE: f32 = 10.0;
const PM_FRICTION: f32 = 6.0;
const PM_WATERFRICTION: f32 = 1.0;

const JUMP_VELOCITY: f32 = 270.0;

// zeroed before each pmove
#[derive(Clone, Default)]
struct PmLocal {
    origin: Vec3,
    velocity: Vec3,

    forward: Vec3,
    right: Vec3,
    up: Vec3,
    frametime: f32,

    groundplane: CPlane,
    previous_origin: [i16; 3],
}

struct PmoveContext<'a, W: CollisionModel + ?Sized> {
    pm: &'a mut PmoveData,
    pml: PmLocal,
    world: &'a W,
}

/// Slide off of the impacting surface.
fn pm_clip_velocity(inv: &Vec3, normal: &Vec3, overbounce: f32) -> Vec3 {
    let backoff = dot_product(inv, normal) * overbounce;
    let mut out = [0.0f32; 3];
    for i in 0..3 {
        out[i] = inv[i] - normal[i] * backoff;
        if out[i] > -STOP_EPSILON && out[i] < STOP_EPSILON {
            out[i] = 0.0;
        }
    }
    out
}

impl<'a, W: CollisionModel + ?Sized> PmoveContext<'a, W> {
    fn trace(&self, start: &Vec3, end: &Vec3) -> Trace {
        self.world
            .box_trace(start, end, &self.pm.mins, &self.pm.maxs, self.pm.passent, MASK_PLAYERSOLID)
    }

    fn touch(&mut self, ent: i32) {
        if ent >= 0 && self.pm.touchents.len() < MAXTOUCH && !self.pm.touchents.contains(&ent) {
            self.pm.touchents.push(ent);
        }
    }

    fn step_slide_move_inner(&mut self) {
        let primal_velocity = self.pml.velocity;
        let mut numplanes: usize = 0;
        let mut planes = [[0.0f32; 3]; MAX_CLIP_PLANES];
        let mut time_left = self.pml.frametime;

        for _bumpcount in 0..4 {
            let end = [
                self.pml.origin[0] + time_left * self.pml.velocity[0],
                self.pml.origin[1] + time_left * self.pml.velocity[1],
                self.pml.origin[2] + time_left * self.pml.velocity[2],
            ];

            let trace = self.trace(&self.pml.origin, &end);

            if trace.allsolid {
                // trapped in another solid
                self.pml.velocity[2] = 0.0;
                return;
            }

            if trace.fraction > 0.0 {
                self.pml.origin = trace.endpos;
                numplanes = 0;
            }

            if trace.fraction == 1.0 {
                break;
            }

            self.touch(trace.ent_index);

            time_left -= time_left * trace.fraction;

            if numplanes >= MAX_CLIP_PLANES {
                self.pml.velocity = VEC3_ORIGIN;
                break;
            }

            planes[numplanes] = trace.plane.normal;
            numplanes += 1;

            // make the velocity parallel to all of the clip planes
            let mut found = false;
            for i in 0..numplanes {
                self.pml.velocity = pm_clip_velocity(&self.pml.velocity, &planes[i], 1.01);
                let ok = (0..numplanes).all(|j| j == i || dot_product(&self.pml.velocity, &planes[j]) >= 0.0);
                if ok {
                    found = true;
                    break;
                }
            }

            if !found {
                // go along the crease
                if numplanes != 2 {
                    self.pml.velocity = VEC3_ORIGIN;
                    break;
                }
                let dir = cross_product(&planes[0], &planes[1]);
                let d = dot_product(&dir, &self.pml.velocity);
                self.pml.velocity = vector_scale(&dir, d);
            }

            // turned against the original velocity: stop dead
            if dot_product(&self.pml.velocity, &primal_velocity) <= 0.0 {
                self.pml.velocity = VEC3_ORIGIN;
                break;
            }
        }

        if self.pm.s.pm_time != 0 {
            self.pml.velocity = primal_velocity;
        }
    }

    fn step_slide_move(&mut self) {
        let start_o = self.pml.origin;
        let start_v = self.pml.velocity;

        self.step_slide_move_inner();

        let down_o = self.pml.origin;
        let down_v = self.pml.velocity;

        let mut up = start_o;
        up[2] += STEPSIZE;

        let trace = self.trace(&up, &up);
        if trace.allsolid {
            return; // can't step up
        }

        // try sliding above
        self.pml.origin = up;
        self.pml.velocity = start_v;

        self.step_slide_move_inner();

        // push down the final amount
        let mut down = self.pml.origin;
        down[2] -= STEPSIZE;
        let trace = self.trace(&self.pml.origin, &down);
        if !trace.allsolid {
            self.pml.origin = trace.endpos;
        }

        let up = self.pml.origin;

        let down_dist = (down_o[0] - start_o[0]).powi(2) + (down_o[1] - start_o[1]).powi(2);
        let up_dist = (up[0] - start_o[0]).powi(2) + (up[1] - start_o[1]).powi(2);

        if down_dist > up_dist || trace.plane.normal[2] < MIN_STEP_NORMAL {
            self.pml.origin = down_o;
            self.pml.velocity = down_v;
            return;
        }
        // walking along a plane keeps the z from the lower move
        self.pml.velocity[2] = down_v[2];
    }

    fn friction(&mut self) {
        let speed = vector_length(&self.pml.velocity);
        if speed < 1.0 {
            self.pml.velocity[0] = 0.0;
            self.pml.velocity[1] = 0.0;
            return;
        }

        let mut drop = 0.0f32;

        if self.pm.groundentity >= 0 {
            let control = if speed < PM_STOPSPEED { PM_STOPSPEED } else { speed };
            drop += control * PM_FRICTION * self.pml.frametime;
        }

        if self.pm.waterlevel != 0 {
            drop += speed * PM_WATERFRICTION * self.pm.waterlevel as f32 * self.pml.frametime;
        }

        let newspeed = (speed - drop).max(0.0) / speed;
        self.pml.velocity = vector_scale(&self.pml.velocity, newspeed);
    }

    fn accelerate(&mut self, wishdir: &Vec3, wishspeed: f32, accel: f32) {
        let currentspeed = dot_product(&self.pml.velocity, wishdir);
        let addspeed = wishspeed - currentspeed;
        if addspeed <= 0.0 {
            return;
        }
        let accelspeed = (accel * self.pml.frametime * wishspeed).min(addspeed);
        for i in 0..3 {
            self.pml.velocity[i] += accelspeed * wishdir[i];
        }
    }

    fn water_move(&mut self) {
        let fm = self.pm.cmd.forwardmove as f32;
        let sm = self.pm.cmd.sidemove as f32;

        let mut wishvel: Vec3 = [0.0; 3];
        for i in 0..3 {
            wishvel[i] = self.pml.forward[i] * fm + self.pml.right[i] * sm;
        }

        if self.pm.cmd.forwardmove == 0 && self.pm.cmd.sidemove == 0 && self.pm.cmd.upmove == 0 {
            wishvel[2] -= 60.0; // drift towards bottom
        } else {
            wishvel[2] += self.pm.cmd.upmove as f32;
        }

        let mut wishdir = wishvel;
        let wishspeed = vector_normalize(&mut wishdir).min(PM_MAXSPEED) * 0.5;

        self.accelerate(&wishdir, wishspeed, PM_WATERACCELERATE);
        self.step_slide_move();
    }

    fn air_move(&mut self) {
        let fmove = self.pm.cmd.forwardmove as f32;
        let smove = self.pm.cmd.sidemove as f32;

        let mut wishvel: Vec3 = [0.0; 3];
        for i in 0..2 {
            wishvel[i] = self.pml.forward[i] * fmove + self.pml.right[i] * smove;
        }

        let mut wishdir = wishvel;
        let maxspeed = if self.pm.s.pm_flags & PMF_DUCKED != 0 { PM_DUCKSPEED } else { PM_MAXSPEED };
        let wishspeed = vector_normalize(&mut wishdir).min(maxspeed);

        let gravity = self.pm.s.gravity as f32;

        if self.pm.groundentity >= 0 {
            // walking on ground
            self.pml.velocity[2] = 0.0;
            self.accelerate(&wishdir, wishspeed, PM_ACCELERATE);

            // negative gravity still pulls off the ground
            if gravity > 0.0 {
                self.pml.velocity[2] = 0.0;
            } else {
                self.pml.velocity[2] -= gravity * self.pml.frametime;
            }

            if self.pml.velocity[0] == 0.0 && self.pml.velocity[1] == 0.0 {
                return;
            }
            self.step_slide_move();
        } else {
            // little air control
            self.accelerate(&wishdir, wishspeed, 1.0);
            self.pml.velocity[2] -= gravity * self.pml.frametime;
            self.step_slide_move();
        }
    }

    fn categorize_position(&mut self) {
        // see if standing on something solid
        let mut point = self.pml.origin;
        point[2] -= 0.25;

        if self.pml.velocity[2] > 180.0 {
            self.pm.s.pm_flags &= !PMF_ON_GROUND;
            self.pm.groundentity = -1;
        } else {
            let trace = self.trace(&self.pml.origin, &point);
            self.pml.groundplane = trace.plane;

            if trace.ent_index < 0 || (trace.plane.normal[2] < MIN_STEP_NORMAL && !trace.startsolid) {
                self.pm.groundentity = -1;
                self.pm.s.pm_flags &= !PMF_ON_GROUND;
            } else {
                self.pm.groundentity = trace.ent_index;

                if self.pm.s.pm_flags & PMF_ON_GROUND == 0 {
                    // just hit the ground
                    self.pm.s.pm_flags |= PMF_ON_GROUND;
                    // no landing time when just going down a slope
                    if self.pml.velocity[2] < -200.0 {
                        self.pm.s.pm_flags |= PMF_TIME_LAND;
                        self.pm.s.pm_time = if self.pml.velocity[2] < -400.0 { 25 } else { 18 };
                    }
                }
            }

            self.touch(trace.ent_index);
        }

        // waterlevel, accounting for ducking
        self.pm.waterlevel = 0;
        self.pm.watertype = 0;

        let sample2 = (self.pm.viewheight - self.pm.mins[2]) as i32;
        let sample1 = sample2 / 2;

        let mut point = [
            self.pml.origin[0],
            self.pml.origin[1],
            self.pml.origin[2] + self.pm.mins[2] + 1.0,
        ];
        let cont = self.world.point_contents(&point);
        if cont & MASK_WATER != 0 {
            self.pm.watertype = cont;
            self.pm.waterlevel = 1;
            point[2] = self.pml.origin[2] + self.pm.mins[2] + sample1 as f32;
            if self.world.point_contents(&point) & MASK_WATER != 0 {
                self.pm.waterlevel = 2;
                point[2] = self.pml.origin[2] + self.pm.mins[2] + sample2 as f32;
                if self.world.point_contents(&point) & MASK_WATER != 0 {
                    self.pm.waterlevel = 3;
                }
            }
        }
    }

    fn check_jump(&mut self) {
        if self.pm.s.pm_flags & PMF_TIME_LAND != 0 {
            return;
        }

        if self.pm.cmd.upmove < 10 {
            self.pm.s.pm_flags &= !PMF_JUMP_HELD;
            return;
        }

        // must wait for jump to be released
        if self.pm.s.pm_flags & PMF_JUMP_HELD != 0 {
            return;
        }

        if self.pm.s.pm_type == PmType::Dead {
            return;
        }

        if self.pm.waterlevel >= 2 {
            // swimming, not jumping
            self.pm.groundentity = -1;
            if self.pml.velocity[2] <= -300.0 {
                return;
            }
            self.pml.velocity[2] = match self.pm.watertype {
                t if t & CONTENTS_WATER != 0 => 100.0,
                t if t & CONTENTS_SLIME != 0 => 80.0,
                _ => 50.0,
            };
            return;
        }

        if self.pm.groundentity < 0 {
            return;
        }

        self.pm.s.pm_flags |= PMF_JUMP_HELD;
        self.pm.groundentity = -1;
        self.pml.velocity[2] = (self.pml.velocity[2] + JUMP_VELOCITY).max(JUMP_VELOCITY);
    }

    fn fly_move(&mut self) {
        self.pm.viewheight = 22.0;

        let speed = vector_length(&self.pml.velocity);
        if speed < 1.0 {
            self.pml.velocity = VEC3_ORIGIN;
        } else {
            let friction = PM_FRICTION * 1.5;
            let control = if speed < PM_STOPSPEED { PM_STOPSPEED } else { speed };
            let drop = control * friction * self.pml.frametime;
            let newspeed = (speed - drop).max(0.0) / speed;
            self.pml.velocity = vector_scale(&self.pml.velocity, newspeed);
        }

        let fmove = self.pm.cmd.forwardmove as f32;
        let smove = self.pm.cmd.sidemove as f32;

        vector_normalize(&mut self.pml.forward);
        vector_normalize(&mut self.pml.right);

        let mut wishvel: Vec3 = [0.0; 3];
        for i in 0..3 {
            wishvel[i] = self.pml.forward[i] * fmove + self.pml.right[i] * smove;
        }
        wishvel[2] += self.pm.cmd.upmove as f32;

        let mut wishdir = wishvel;
        let wishspeed = vector_normalize(&mut wishdir).min(PM_MAXSPEED);

        self.accelerate(&wishdir, wishspeed, PM_ACCELERATE);

        // spectators pass through everything
        for i in 0..3 {
            self.pml.origin[i] += self.pml.frametime * self.pml.velocity[i];
        }
    }

    fn check_duck(&mut self) {
        self.pm.mins[0] = -16.0;
        self.pm.mins[1] = -16.0;
        self.pm.maxs[0] = 16.0;
        self.pm.maxs[1] = 16.0;

        if self.pm.s.pm_type == PmType::Gib {
            self.pm.mins[2] = 0.0;
            self.pm.maxs[2] = 16.0;
            self.pm.viewheight = 8.0;
            return;
        }

        self.pm.mins[2] = -24.0;

        if self.pm.s.pm_type == PmType::Dead {
            self.pm.s.pm_flags |= PMF_DUCKED;
        } else if self.pm.cmd.upmove < 0 && self.pm.s.pm_flags & PMF_ON_GROUND != 0 {
            self.pm.s.pm_flags |= PMF_DUCKED;
        } else if self.pm.s.pm_flags & PMF_DUCKED != 0 {
            // stand up if possible
            self.pm.maxs[2] = 32.0;
            let trace = self.trace(&self.pml.origin, &self.pml.origin);
            if !trace.allsolid {
                self.pm.s.pm_flags &= !PMF_DUCKED;
            }
        }

        if self.pm.s.pm_flags & PMF_DUCKED != 0 {
            self.pm.maxs[2] = 4.0;
            self.pm.viewheight = -2.0;
        } else {
            self.pm.maxs[2] = 32.0;
            self.pm.viewheight = 22.0;
        }
    }

    fn dead_move(&mut self) {
        if self.pm.groundentity < 0 {
            return;
        }

        // extra friction
        let forward = vector_length(&self.pml.velocity) - 20.0;
        if forward <= 0.0 {
            self.pml.velocity = VEC3_ORIGIN;
        } else {
            vector_normalize(&mut self.pml.velocity);
            self.pml.velocity = vector_scale(&self.pml.velocity, forward);
        }
    }

    fn good_position(&self) -> bool {
        if self.pm.s.pm_type == PmType::Spectator {
            return true;
        }
        let origin = self.pm.s.origin_f32();
        !self.trace(&origin, &origin).allsolid
    }

    /// Round the float origin to the network's 1/8 grid, nudging it away
    /// from solids if the rounded spot is blocked.
    fn snap_position(&mut self) {
        const JITTERBITS: [i32; 8] = [0, 4, 1, 2, 3, 5, 6, 7];

        for i in 0..3 {
            self.pm.s.velocity[i] = (self.pml.velocity[i] * 8.0) as i16;
        }

        let mut sign = [0i16; 3];
        for i in 0..3 {
            sign[i] = if self.pml.origin[i] >= 0.0 { 1 } else { -1 };
            self.pm.s.origin[i] = (self.pml.origin[i] * 8.0) as i16;
            if self.pm.s.origin[i] as f32 * 0.125 == self.pml.origin[i] {
                sign[i] = 0;
            }
        }
        let base = self.pm.s.origin;

        for bits in JITTERBITS {
            self.pm.s.origin = base;
            for i in 0..3 {
                if bits & (1 << i) != 0 {
                    self.pm.s.origin[i] = self.pm.s.origin[i].wrapping_add(sign[i]);
                }
            }
            if self.good_position() {
                return;
            }
        }

        // go back to the last position
        self.pm.s.origin = self.pml.previous_origin;
    }

    fn initial_snap_position(&mut self) {
        const OFFSET: [i16; 3] = [0, -1, 1];
        let base = self.pm.s.origin;

        for z in OFFSET {
            for y in OFFSET {
                for x in OFFSET {
                    self.pm.s.origin = [
                        base[0].wrapping_add(x),
                        base[1].wrapping_add(y),
                        base[2].wrapping_add(z),
                    ];
                    if self.good_position() {
                        self.pml.origin = self.pm.s.origin_f32();
                        self.pml.previous_origin = self.pm.s.origin;
                        return;
                    }
                }
            }
        }

        self.pm.s.origin = base;
        log::debug!("Bad InitialSnapPosition");
    }

    fn clamp_angles(&mut self) {
        if self.pm.s.pm_flags & PMF_TIME_TELEPORT != 0 {
            self.pm.viewangles[YAW] =
                short2angle(self.pm.cmd.angles[YAW].wrapping_add(self.pm.s.delta_angles[YAW]));
            self.pm.viewangles[PITCH] = 0.0;
            self.pm.viewangles[2] = 0.0;
        } else {
            for i in 0..3 {
                let temp = self.pm.cmd.angles[i].wrapping_add(self.pm.s.delta_angles[i]);
                self.pm.viewangles[i] = short2angle(temp);
            }

            // don't look up or down more than 90 degrees
            if self.pm.viewangles[PITCH] > 89.0 && self.pm.viewangles[PITCH] < 180.0 {
                self.pm.viewangles[PITCH] = 89.0;
            } else if self.pm.viewangles[PITCH] < 271.0 && self.pm.viewangles[PITCH] >= 180.0 {
                self.pm.viewangles[PITCH] = 271.0;
            }
        }
        (self.pml.forward, self.pml.right, self.pml.up) = angle_vectors(&self.pm.viewangles);
    }

    fn execute(&mut self) {
        self.pm.touchents.clear();
        self.pm.viewangles = [0.0; 3];
        self.pm.viewheight = 0.0;
        self.pm.groundentity = -1;
        self.pm.watertype = 0;
        self.pm.waterlevel = 0;

        self.pml = PmLocal::default();
        self.pml.origin = self.pm.s.origin_f32();
        for i in 0..3 {
            self.pml.velocity[i] = self.pm.s.velocity[i] as f32 * 0.125;
        }

        // saved in case we get stuck
        self.pml.previous_origin = self.pm.s.origin;
        self.pml.frametime = self.pm.cmd.msec as f32 * 0.001;

        self.clamp_angles();

        if self.pm.s.pm_type == PmType::Spectator {
            self.fly_move();
            self.snap_position();
            return;
        }

        if self.pm.s.pm_type as u8 >= PmType::Dead as u8 {
            self.pm.cmd.forwardmove = 0;
            self.pm.cmd.sidemove = 0;
            self.pm.cmd.upmove = 0;
        }

        if self.pm.s.pm_type == PmType::Freeze {
            return;
        }

        self.check_duck();

        if self.pm.snapinitial {
            self.initial_snap_position();
        }

        self.categorize_position();

        if self.pm.s.pm_type == PmType::Dead {
            self.dead_move();
        }

        // drop timing counter
        if self.pm.s.pm_time != 0 {
            let msec = (self.pm.cmd.msec >> 3).max(1);
            if msec >= self.pm.s.pm_time {
                self.pm.s.pm_flags &= !(PMF_TIME_LAND | PMF_TIME_TELEPORT);
                self.pm.s.pm_time = 0;
            } else {
                self.pm.s.pm_time -= msec;
            }
        }

        if self.pm.s.pm_flags & PMF_TIME_TELEPORT != 0 {
            // teleport pause stays exactly in place
        } else {
            self.check_jump();
            self.friction();

            if self.pm.waterlevel >= 2 {
                self.water_move();
            } else {
                let mut angles = self.pm.viewangles;
                if angles[PITCH] > 180.0 {
                    angles[PITCH] -= 360.0;
                }
                angles[PITCH] /= 3.0;
                (self.pml.forward, self.pml.right, self.pml.up) = angle_vectors(&angles);

                self.air_move();
            }
        }

        // ground and water for the final spot
        self.categorize_position();
        self.snap_position();
    }
}

/// Run one command's worth of movement on `pm.s`.
pub fn pmove<W: CollisionModel + ?Sized>(pm: &mut PmoveData, world: &W) {
    let mut ctx = PmoveContext {
        pm,
        pml: PmLocal::default(),
        world,
    };
    ctx.execute();
}
