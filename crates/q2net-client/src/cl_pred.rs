// cl_pred.rs -- client-side movement prediction
//
// Every command sent is run through the same movement code the server uses,
// starting from the last state the server confirmed, so the player sees the
// result before the server's answer comes back. When the answer arrives it
// is compared with what was predicted for that command; a miss snaps the
// prediction to the server's state and replays the commands sent since.

use q2net_common::cmodel::{CollisionModel, EntityClipWorld};
use q2net_common::pmove::pmove;
use q2net_common::q_shared::*;

use crate::client::*;

/// Clipping world for prediction: the map plus every solid entity in the
/// current frame except ourselves.
pub fn cl_prediction_world<'a, W: CollisionModel + ?Sized>(
    world: &'a W,
    cl: &ClientState,
) -> EntityClipWorld<'a, W> {
    let mut clip = EntityClipWorld::new(world);
    for ent in cl.entities.frame_entities(&cl.frame) {
        if ent.number == cl.playernum + 1 {
            continue;
        }
        clip.add_entity(ent.number, &ent.origin, ent.solid);
    }
    clip
}

/// Replay commands `ack+1 ..= current` from `base`, storing the predicted
/// state of each. Commands no longer in the history are skipped. Returns the
/// movement block of the last command run, or None if none was or if `ack`
/// is too far behind to predict from.
pub fn predict_movement<W: CollisionModel + ?Sized>(
    history: &mut CommandHistory,
    base: &PmoveState,
    ack: i32,
    current: i32,
    world: &W,
    passent: i32,
) -> Option<PmoveData> {
    if current - ack >= CMD_BACKUP as i32 {
        // too far out of date, freeze
        log::debug!("exceeded CMD_BACKUP");
        return None;
    }

    let mut pm = PmoveData {
        s: *base,
        passent,
        ..Default::default()
    };
    let mut ran = false;

    for sequence in (ack + 1)..=current {
        let Some(cmd) = history.command(sequence) else {
            continue;
        };
        pm.cmd = *cmd;
        pmove(&mut pm, world);
        history.set_predicted(sequence, pm.s);
        ran = true;
    }

    ran.then_some(pm)
}

/// Result of comparing a prediction with the server's state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PredictionCheck {
    /// Prediction disabled for this frame.
    Skipped,
    /// The acknowledged command is no longer buffered.
    Stale,
    Hit,
    /// Corrected; the error is in world units, zero for teleports.
    Miss { error: Vec3 },
}

/// Compare what we predicted for command `ack` with the authoritative state
/// in the newest frame. On a miss, rewind to the server's state and replay
/// every buffered command after `ack`.
pub fn check_prediction_error<W: CollisionModel + ?Sized>(
    cl: &mut ClientState,
    ack: i32,
    tolerance: PredictionTolerance,
    world: &W,
    showmiss: bool,
) -> PredictionCheck {
    let actual = cl.frame.playerstate.pmove;
    if actual.pm_flags & PMF_NO_PREDICTION != 0 {
        return PredictionCheck::Skipped;
    }

    let predicted = match cl.cmds.oldest_sequence() {
        Some(oldest) if ack >= oldest => cl.cmds.predicted(ack),
        _ => None,
    };
    let Some(predicted) = predicted else {
        cl.prediction_stats.stale += 1;
        return PredictionCheck::Stale;
    };

    cl.prediction_stats.checks += 1;
    if tolerance.accepts(&predicted, &actual) {
        return PredictionCheck::Hit;
    }

    cl.prediction_stats.misses += 1;
    let mut error = [0.0f32; 3];
    for i in 0..3 {
        error[i] = (actual.origin[i] as f32 - predicted.origin[i] as f32) * 0.125;
    }
    if showmiss {
        log::debug!("prediction miss on {}: {:?}", cl.frame.serverframe, error);
    }
    if vector_length(&error) > MAX_PREDICTION_ERROR {
        // a teleport or something
        error = [0.0; 3];
    }
    cl.prediction_error = error;

    // rewind to the server's state and replay what it has not seen yet
    cl.cmds.set_predicted(ack, actual);
    let current = cl.cmds.newest_sequence().unwrap_or(ack);
    let passent = cl.playernum + 1;
    let clip = cl_prediction_world(world, cl);
    let replayed = predict_movement(&mut cl.cmds, &actual, ack, current, &clip, passent);
    store_prediction(cl, replayed.as_ref().map_or(actual, |pm| pm.s), replayed.as_ref());

    PredictionCheck::Miss { error }
}

/// Predict through the newest command `current`, starting from the state
/// confirmed for `ack`.
pub fn cl_predict_movement<W: CollisionModel + ?Sized>(
    cl: &mut ClientState,
    ack: i32,
    current: i32,
    world: &W,
) {
    let base = cl.frame.playerstate.pmove;
    let passent = cl.playernum + 1;
    let clip = cl_prediction_world(world, cl);
    let result = predict_movement(&mut cl.cmds, &base, ack, current, &clip, passent);
    if let Some(pm) = result {
        store_prediction(cl, pm.s, Some(&pm));
    }
}

fn store_prediction(cl: &mut ClientState, state: PmoveState, pm: Option<&PmoveData>) {
    cl.predicted_state = state;
    cl.predicted_origin = state.origin_f32();
    if let Some(pm) = pm {
        cl.predicted_angles = pm.viewangles;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use q2net_common::cmodel::BoxWorld;

    fn standing() -> PmoveState {
        PmoveState {
            origin: [0, 0, 193],
            gravity: 800,
            ..Default::default()
        }
    }

    fn forward(msec: u8) -> UserCmd {
        UserCmd {
            msec,
            forwardmove: 200,
            ..Default::default()
        }
    }

    /// Run commands the way the server would, one pmove each.
    fn server_states(world: &BoxWorld, start: PmoveState, cmds: &[UserCmd]) -> Vec<PmoveState> {
        let mut pm = PmoveData { s: start, passent: 1, ..Default::default() };
        cmds.iter()
            .map(|cmd| {
                pm.cmd = *cmd;
                pmove(&mut pm, world);
                pm.s
            })
            .collect()
    }

    fn client_with_history(cmds: &[UserCmd]) -> ClientState {
        let mut cl = ClientState::new();
        for (i, cmd) in cmds.iter().enumerate() {
            cl.cmds.store(i as i32 + 1, *cmd, 0);
        }
        cl
    }

    #[test]
    fn test_predict_matches_server() {
        let world = BoxWorld::with_floor(0.0);
        let cmds = vec![forward(16); 5];
        let mut cl = client_with_history(&cmds);
        cl.frame.playerstate.pmove = standing();

        cl_predict_movement(&mut cl, 0, 5, &world);

        let expected = server_states(&world, standing(), &cmds);
        for (i, state) in expected.iter().enumerate() {
            assert_eq!(cl.cmds.predicted(i as i32 + 1), Some(*state));
        }
        assert_eq!(cl.predicted_state, expected[4]);
        assert!(cl.predicted_origin[0] > 0.0);
    }

    #[test]
    fn test_correct_prediction_is_not_touched() {
        let world = BoxWorld::with_floor(0.0);
        let cmds = vec![forward(16); 6];
        let mut cl = client_with_history(&cmds);
        cl.frame.playerstate.pmove = standing();
        cl_predict_movement(&mut cl, 0, 6, &world);
        let before = cl.predicted_state;

        // the server confirms command 3 exactly as predicted
        cl.frame.playerstate.pmove = server_states(&world, standing(), &cmds[..3])[2];
        for tolerance in [PredictionTolerance::PerAxis(0.0), PredictionTolerance::Aggregate(0.0)] {
            let check = check_prediction_error(&mut cl, 3, tolerance, &world, false);
            assert_eq!(check, PredictionCheck::Hit);
        }
        assert_eq!(cl.predicted_state, before);
        assert_eq!(cl.prediction_stats.misses, 0);
        assert_eq!(cl.prediction_stats.checks, 2);
    }

    #[test]
    fn test_miss_replays_from_server_state() {
        let world = BoxWorld::with_floor(0.0);
        let cmds = vec![forward(16); 6];

        for tolerance in [PredictionTolerance::PerAxis(0.125), PredictionTolerance::Aggregate(0.125)] {
            let mut cl = client_with_history(&cmds);
            cl.frame.playerstate.pmove = standing();
            cl_predict_movement(&mut cl, 0, 6, &world);

            // the server had us somewhere else after command 3
            let mut actual = server_states(&world, standing(), &cmds[..3])[2];
            actual.origin[1] += 16; // two units sideways
            cl.frame.playerstate.pmove = actual;

            let check = check_prediction_error(&mut cl, 3, tolerance, &world, true);
            match check {
                PredictionCheck::Miss { error } => assert_eq!(error, [0.0, 2.0, 0.0]),
                other => panic!("expected a miss, got {:?}", other),
            }
            assert_eq!(cl.prediction_stats.misses, 1);
            assert_eq!(cl.cmds.predicted(3), Some(actual));

            let replay = server_states(&world, actual, &cmds[3..]);
            assert_eq!(cl.cmds.predicted(4), Some(replay[0]));
            assert_eq!(cl.cmds.predicted(6), Some(replay[2]));
            assert_eq!(cl.predicted_state, replay[2]);
        }
    }

    #[test]
    fn test_teleport_clears_error() {
        let world = BoxWorld::with_floor(0.0);
        let cmds = vec![forward(16); 2];
        let mut cl = client_with_history(&cmds);
        cl.frame.playerstate.pmove = standing();
        cl_predict_movement(&mut cl, 0, 2, &world);

        let mut actual = server_states(&world, standing(), &cmds[..1])[0];
        actual.origin[0] += 8 * 500;
        cl.frame.playerstate.pmove = actual;
        let check = check_prediction_error(&mut cl, 1, PredictionTolerance::default(), &world, false);
        assert_eq!(check, PredictionCheck::Miss { error: [0.0; 3] });
        assert_eq!(cl.prediction_error, [0.0; 3]);
    }

    #[test]
    fn test_stale_ack_is_accepted() {
        let world = BoxWorld::with_floor(0.0);
        let cmds = vec![forward(16); 70];
        let mut cl = client_with_history(&cmds);
        cl.frame.playerstate.pmove = standing();

        let check = check_prediction_error(&mut cl, 2, PredictionTolerance::default(), &world, false);
        assert_eq!(check, PredictionCheck::Stale);
        assert_eq!(cl.prediction_stats.stale, 1);
        assert_eq!(cl.prediction_stats.checks, 0);
    }

    #[test]
    fn test_no_prediction_flag() {
        let world = BoxWorld::new();
        let mut cl = client_with_history(&[forward(16)]);
        cl.frame.playerstate.pmove.pm_flags = PMF_NO_PREDICTION;
        let check = check_prediction_error(&mut cl, 1, PredictionTolerance::default(), &world, false);
        assert_eq!(check, PredictionCheck::Skipped);
    }

    #[test]
    fn test_other_players_block_prediction() {
        let world = BoxWorld::with_floor(0.0);
        let mut cl = client_with_history(&vec![forward(50); 20]);
        cl.playernum = 0;
        cl.frame.playerstate.pmove = standing();

        // another player standing 64 units ahead
        let mut other = EntityState::with_number(2);
        other.origin = [64.0, 0.0, 24.125];
        other.solid = encode_solid(&[-16.0, -16.0, -24.0], &[16.0, 16.0, 32.0]);
        cl.frame.parse_entities = cl.entities.parse_count;
        cl.entities.push_parse_entity(other);
        cl.frame.num_entities = 1;

        cl_predict_movement(&mut cl, 0, 20, &world);
        assert!(cl.predicted_origin[0] < 32.0, "walked through at {:?}", cl.predicted_origin);
        assert!(cl.predicted_origin[0] > 16.0);
    }

    #[test]
    fn test_freeze_when_ack_too_old() {
        let world = BoxWorld::with_floor(0.0);
        let mut cl = ClientState::new();
        for sequence in 40..=100 {
            cl.cmds.store(sequence, forward(16), 0);
        }
        cl.frame.playerstate.pmove = standing();

        let result = predict_movement(&mut cl.cmds, &standing(), 0, 100, &world, 1);
        assert!(result.is_none());
        for sequence in 40..=100 {
            assert_eq!(cl.cmds.predicted(sequence), None);
        }

        cl_predict_movement(&mut cl, 0, 100, &world);
        assert_eq!(cl.predicted_state, PmoveState::default());
    }
}
