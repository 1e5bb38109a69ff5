macro_rules! pump_ready {
    ($e:expr) => {
        match $e {
            ::std::task::Poll::Ready(x) => x,
            ::std::task::Poll::Pending => return ::std::result::Result::Ok(Pump::Pending),
        }
    }
}

/// Outcome of one step of a sub-machine of the session.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(super) enum Pump {
    Progress,
    Pending,
}

impl Pump {
    pub fn is_progress(self) -> bool {
        match self {
            Pump::Progress => true,
            Pump::Pending => false,
        }
    }
}

impl std::ops::BitOrAssign for Pump {
    fn bitor_assign(&mut self, rhs: Pump) {
        if rhs.is_progress() {
            *self = Pump::Progress;
        }
    }
}
