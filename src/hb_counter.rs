//! Heartbeat counters: per-peer accumulators that turn a stream of
//! positive/negative connectivity signals into a boolean reachability
//! verdict.

use serde::{Deserialize, Serialize};

pub trait HeartbeatCounter: Send {
    fn positive(&mut self);
    fn negative(&mut self);
    fn report(&mut self) -> bool;
    fn init(&mut self, positive: bool);
}

/// Token bucket in `[0, max]`; reachable while any token remains.
pub struct SimpleBucketCounter {
    counter: i64,
    max_token: i64,
}

impl SimpleBucketCounter {
    pub fn new(max_token: i64) -> Self {
        SimpleBucketCounter {
            counter: 0,
            max_token,
        }
    }
}

impl HeartbeatCounter for SimpleBucketCounter {
    fn positive(&mut self) {
        if self.counter >= self.max_token {
            self.counter = self.max_token;
        } else {
            self.counter += 1;
        }
    }

    fn negative(&mut self) {
        if self.counter <= 0 {
            self.counter = 0;
        } else {
            self.counter -= 1;
        }
    }

    fn report(&mut self) -> bool {
        self.counter > 0
    }

    fn init(&mut self, _positive: bool) {
        self.counter = 0;
    }
}

/// Thresholded bucket parameters: bound `max`, signal weights `w_plus` /
/// `w_minus`, re-initialisation points `xi_plus` / `xi_minus` and the report
/// threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketConfig {
    pub max: i64,
    pub w_plus: i64,
    pub w_minus: i64,
    pub xi_plus: i64,
    pub xi_minus: i64,
    pub threshold: i64,
}

pub const NAIVE_BUCKET: BucketConfig = BucketConfig {
    max: 2,
    w_plus: 1,
    w_minus: 1,
    xi_plus: 2,
    xi_minus: 0,
    threshold: 0,
};

pub const BOLD_BUCKET: BucketConfig = BucketConfig {
    max: 100,
    w_plus: 30,
    w_minus: 10,
    xi_plus: 100,
    xi_minus: 0,
    threshold: 55,
};

pub const CAUTIOUS_BUCKET: BucketConfig = BucketConfig {
    max: 100,
    w_plus: 30,
    w_minus: 10,
    xi_plus: 100,
    xi_minus: 0,
    threshold: 75,
};

/// Weighted bucket with a report threshold. Under `polarize`, every verdict
/// flip re-initialises the counter to the matching `xi` point, amplifying
/// hysteresis.
pub struct CustomizedBucketCounter {
    counter: i64,
    last_result: bool,
    polarize: bool,
    config: BucketConfig,
}

impl CustomizedBucketCounter {
    pub fn new(config: BucketConfig, polarize: bool) -> Self {
        CustomizedBucketCounter {
            counter: 0,
            last_result: false,
            polarize,
            config,
        }
    }
}

impl HeartbeatCounter for CustomizedBucketCounter {
    fn positive(&mut self) {
        if self.counter < self.config.max {
            self.counter += self.config.w_plus;
            if self.counter > self.config.max {
                self.counter = self.config.max;
            }
        }
    }

    fn negative(&mut self) {
        if self.counter > 0 {
            self.counter -= self.config.w_minus;
            if self.counter < 0 {
                self.counter = 0;
            }
        }
    }

    fn report(&mut self) -> bool {
        let result = self.counter > self.config.threshold;
        if self.polarize && self.last_result != result {
            self.init(result);
        } else {
            self.last_result = result;
        }
        self.last_result
    }

    fn init(&mut self, positive: bool) {
        self.counter = if positive {
            self.config.xi_plus
        } else {
            self.config.xi_minus
        };
        self.last_result = positive;
    }
}

/// Diagnostic counter pinned to one verdict.
pub struct DummyCounter {
    always: bool,
}

impl HeartbeatCounter for DummyCounter {
    fn positive(&mut self) {}

    fn negative(&mut self) {}

    fn report(&mut self) -> bool {
        self.always
    }

    fn init(&mut self, _positive: bool) {}
}

/// Two-sided counter that alternates between a positive-staying state and a
/// critical state. On the positive side the counter refills to `b_plus` on
/// every positive signal and decays on negatives; on the critical side
/// positives decay it and negatives refill it toward `b_minus`. Hitting zero
/// re-initialises onto the opposite side.
pub struct BipolarCounter {
    critical: bool,
    counter: i64,
    b_plus: i64,
    b_minus: i64,
}

impl BipolarCounter {
    pub fn new(b_plus: i64, b_minus: i64) -> Self {
        BipolarCounter {
            critical: true,
            counter: b_minus,
            b_plus,
            b_minus,
        }
    }
}

impl HeartbeatCounter for BipolarCounter {
    fn positive(&mut self) {
        if !self.critical {
            self.counter = self.b_plus;
        } else {
            self.counter -= 1;
        }
    }

    fn negative(&mut self) {
        if self.critical && self.counter < self.b_minus {
            self.counter += 1;
        } else {
            self.counter -= 1;
        }
    }

    fn report(&mut self) -> bool {
        if self.counter <= 0 {
            let flip_to_positive = self.critical;
            self.init(flip_to_positive);
        }
        !self.critical
    }

    fn init(&mut self, positive: bool) {
        if positive {
            self.critical = false;
            self.counter = self.b_plus;
        } else {
            self.critical = true;
            self.counter = self.b_minus;
        }
    }
}

/// Counter factory choice, carried by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HbCounterKind {
    Naive { polarize: bool },
    Bold { polarize: bool },
    Cautious { polarize: bool },
    AlwaysConnect,
    AlwaysDisconnect,
    Bipolar { b_plus: i64, b_minus: i64 },
}

impl HbCounterKind {
    pub fn build(&self) -> Box<dyn HeartbeatCounter> {
        match *self {
            HbCounterKind::Naive { polarize } => {
                Box::new(CustomizedBucketCounter::new(NAIVE_BUCKET, polarize))
            }
            HbCounterKind::Bold { polarize } => {
                Box::new(CustomizedBucketCounter::new(BOLD_BUCKET, polarize))
            }
            HbCounterKind::Cautious { polarize } => {
                Box::new(CustomizedBucketCounter::new(CAUTIOUS_BUCKET, polarize))
            }
            HbCounterKind::AlwaysConnect => Box::new(DummyCounter { always: true }),
            HbCounterKind::AlwaysDisconnect => Box::new(DummyCounter { always: false }),
            HbCounterKind::Bipolar { b_plus, b_minus } => {
                Box::new(BipolarCounter::new(b_plus, b_minus))
            }
        }
    }
}
