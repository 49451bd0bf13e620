use std::f64::consts::PI;

use carfac_core::{CarParams, CrossEarCoupling, Ear, EarOutput, EarParams, Ears, EarsConfig};
use rand::{Rng, SeedableRng, rngs::StdRng};

const FS: f64 = 22050.0;
const CHANNELS: usize = 40;
const BLOCK: usize = 100;

fn params() -> EarParams {
    EarParams {
        sample_rate: FS,
        car: CarParams {
            num_channels: Some(CHANNELS),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn tone(freq: f64, n: usize, amp: f64) -> Vec<f64> {
    (0..n).map(|i| amp * (2.0 * PI * freq * i as f64 / FS).sin()).collect()
}

fn run_blocks(ear: &mut Ear, signal: &[f64]) -> Vec<EarOutput> {
    signal
        .chunks(BLOCK)
        .map(|chunk| ear.process_block(chunk).unwrap())
        .collect()
}

fn peak_channel(out: &EarOutput) -> usize {
    let rms = out.bm.rms_profile();
    (0..rms.len()).max_by(|&a, &b| rms[a].total_cmp(&rms[b])).unwrap()
}

#[test]
fn tone_runs_end_to_end() {
    let mut ear = Ear::new(&params()).unwrap();
    let saturation = ear.ihc().coeffs().saturation;
    let outputs = run_blocks(&mut ear, &tone(1000.0, 10 * BLOCK, 0.1));
    assert_eq!(outputs.len(), 10);
    for (k, out) in outputs.iter().enumerate() {
        assert_eq!(out.bm.num_channels(), CHANNELS);
        assert_eq!(out.bm.num_samples(), BLOCK);
        assert!(out.bm.as_slice().iter().all(|v| v.is_finite()), "block {k}: non-finite BM");
        assert!(out.nap.min_value() >= 0.0 && out.nap.max_value() <= saturation);
        assert!(out.damping.iter().all(|&d| (0.0..=1.0).contains(&d)));
    }
    let last = outputs.last().unwrap();
    assert!(last.damping.iter().any(|&d| d > 0.0), "a sustained tone should raise damping");
    let pole = ear.pole_frequencies()[peak_channel(last)];
    assert!(pole > 700.0 && pole < 1500.0, "1 kHz tone peaked at a {pole} Hz channel");
}

/// How far the tone's channel must stand above the channels flanking it.
const PEAK_MARGIN: f64 = 1.4;

#[test]
fn tone_at_a_pole_peaks_in_its_channel() {
    for k in [5, 15, 25] {
        let mut ear = Ear::new(&params()).unwrap();
        let saturation = ear.ihc().coeffs().saturation;
        let signal = tone(ear.pole_frequencies()[k], 10 * BLOCK, 0.1);
        let out = ear.process_waveform(&signal, BLOCK).unwrap();
        let rms = out.bm.rms_profile();

        // A tone at pole k builds over two sections, so its channel is the
        // louder of k and the next channel toward the apex.
        let peak = peak_channel(&out);
        assert!(peak == k || peak == k + 1, "tone at pole {k} peaked at channel {peak}");
        for outer in [k - 1, k + 2] {
            assert!(
                rms[peak] > PEAK_MARGIN * rms[outer],
                "pole {k}: channel {peak} ({}) not {PEAK_MARGIN}x above channel {outer} ({})",
                rms[peak],
                rms[outer]
            );
        }
        assert!(out.nap.channel_mean(peak) > 0.0);
        assert!(out.nap.channel(peak).all(|v| (0.0..saturation).contains(&v)));
    }
}

#[test]
fn silence_from_rest_stays_silent() {
    let mut ear = Ear::new(&params()).unwrap();
    for out in run_blocks(&mut ear, &vec![0.0; 10 * BLOCK]) {
        assert!(out.bm.as_slice().iter().all(|&v| v == 0.0));
        assert!(out.nap.max_value() < 1e-12);
        assert!(out.damping.iter().all(|&d| d < 1e-12));
    }
}

#[test]
fn response_decays_after_input_stops() {
    let mut ear = Ear::new(&params()).unwrap();
    let during = run_blocks(&mut ear, &tone(1000.0, 10 * BLOCK, 0.1));
    let loud = during.last().unwrap().damping.iter().copied().fold(0.0, f64::max);
    let after = run_blocks(&mut ear, &vec![0.0; 100 * BLOCK]);
    let quiet = after.last().unwrap();
    let residual = quiet.damping.iter().copied().fold(0.0, f64::max);
    assert!(residual < 0.1 * loud, "damping {residual} did not decay from {loud}");
    assert!(quiet.nap.max_value() < 1e-6);
}

#[test]
fn feedback_takes_effect_one_block_later() {
    let signal = tone(1000.0, 10 * BLOCK, 0.1);
    let mut closed = Ear::new(&params()).unwrap();
    let mut open = Ear::new(&params()).unwrap();
    open.set_open_loop(true);
    let closed_out = run_blocks(&mut closed, &signal);
    let open_out = run_blocks(&mut open, &signal);

    // Block 0 runs on neutral feedback either way.
    assert_eq!(closed_out[0], open_out[0]);
    // Its AGC output first reaches the CAR in block 1.
    assert_ne!(closed_out[1].bm, open_out[1].bm);

    let closed_nap: f64 = closed_out[9].nap.as_slice().iter().sum();
    let open_nap: f64 = open_out[9].nap.as_slice().iter().sum();
    assert!(closed_nap < open_nap, "feedback should reduce output: {closed_nap} vs {open_nap}");
}

#[test]
fn louder_input_gets_more_damping_and_compression() {
    let mut damping = Vec::new();
    let mut level = Vec::new();
    for amp in [0.01, 0.1, 1.0] {
        let mut ear = Ear::new(&params()).unwrap();
        let outputs = run_blocks(&mut ear, &tone(1000.0, 22 * BLOCK, amp));
        let last = outputs.last().unwrap();
        damping.push(last.damping.iter().sum::<f64>());
        level.push(last.bm.channel_rms(peak_channel(last)));
    }
    assert!(damping[0] < damping[1] && damping[1] < damping[2], "damping {damping:?}");
    // 20 dB more input must give well under 20 dB more output.
    for w in level.windows(2) {
        let gain = w[1] / w[0];
        assert!(gain > 1.0 && gain < 6.0, "BM level ratio {gain} per 20 dB");
    }
}

#[test]
fn extreme_noise_stays_bounded() {
    let mut ear = Ear::new(&params()).unwrap();
    let saturation = ear.ihc().coeffs().saturation;
    let mut rng = StdRng::seed_from_u64(3);
    let noise: Vec<f64> = (0..20 * BLOCK).map(|_| rng.random_range(-10.0..10.0)).collect();
    for out in run_blocks(&mut ear, &noise) {
        assert!(out.bm.as_slice().iter().all(|v| v.is_finite()));
        assert!(out.nap.min_value() >= 0.0 && out.nap.max_value() <= saturation);
        assert!(out.damping.iter().all(|&d| (0.0..=1.0).contains(&d)));
    }
}

#[test]
fn reset_reproduces_fresh_run() {
    let signal = tone(440.0, 5 * BLOCK, 0.3);
    let mut ear = Ear::new(&params()).unwrap();
    let first = run_blocks(&mut ear, &signal);
    ear.reset();
    let second = run_blocks(&mut ear, &signal);
    assert_eq!(first, second);
}

#[test]
fn identical_coupled_ears_match_a_single_ear() {
    let signal = tone(1200.0, 8 * BLOCK, 0.2);
    let mut ears = Ears::new(&EarsConfig {
        ear: params(),
        num_ears: 2,
        coupling: CrossEarCoupling::Designed,
    })
    .unwrap();
    let mut solo = Ear::new(&params()).unwrap();
    for chunk in signal.chunks(BLOCK) {
        let pair = ears.process_block(&[chunk, chunk]).unwrap();
        let single = solo.process_block(chunk).unwrap();
        assert_eq!(pair[0], pair[1]);
        assert_eq!(pair[0], single);
    }
}

#[test]
fn config_json_drives_the_model() {
    let config = EarsConfig::from_json(
        r#"{"ear": {"sample_rate": 16000, "car": {"num_channels": 24}}, "num_ears": 2}"#,
    )
    .unwrap();
    let mut ears = Ears::new(&config).unwrap();
    assert_eq!(ears.num_ears(), 2);
    let left = tone(500.0, 800, 0.1);
    let right = vec![0.0; 800];
    let outputs = ears.process_waveforms(&[left.as_slice(), right.as_slice()], 128).unwrap();
    assert_eq!(outputs[0].bm.num_samples(), 800);
    assert_eq!(outputs[0].bm.num_channels(), 24);
    assert_eq!(outputs[1].bm.max_value(), 0.0);
    assert!(outputs[1].nap.max_value() < 1e-9);
}
