use chrono::{DateTime, Duration, Utc};
use outreach_core::types::{CampaignType, DelayMode};
use outreach_core::OutreachResult;

use crate::catalog;

/// Maps (campaign, step) to the cumulative offset from step 1.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DelayCalculator {
    mode: DelayMode,
}

impl DelayCalculator {
    pub fn new(mode: DelayMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> DelayMode {
        self.mode
    }

    /// Fails with `InvalidStep` for step 0 or past the last step.
    pub fn delay_for(&self, campaign: CampaignType, step_index: u32) -> OutreachResult<Duration> {
        let offset = i64::from(catalog::definition(campaign).step(step_index)?.offset_hours);
        Ok(match self.mode {
            DelayMode::Production => Duration::hours(offset),
            DelayMode::Accelerated => Duration::minutes(offset),
        })
    }

    pub fn fire_time(
        &self,
        campaign: CampaignType,
        step_index: u32,
        trigger_time: DateTime<Utc>,
    ) -> OutreachResult<DateTime<Utc>> {
        Ok(trigger_time + self.delay_for(campaign, step_index)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outreach_core::OutreachError;

    const MODES: [DelayMode; 2] = [DelayMode::Production, DelayMode::Accelerated];

    #[test]
    fn test_first_step_is_immediate() {
        for mode in MODES {
            let calc = DelayCalculator::new(mode);
            for campaign in CampaignType::ALL {
                assert_eq!(calc.delay_for(campaign, 1).unwrap(), Duration::zero());
            }
        }
    }

    #[test]
    fn test_production_tables() {
        let calc = DelayCalculator::new(DelayMode::Production);
        let hours = |c, n| calc.delay_for(c, n).unwrap().num_hours();

        let nurture: Vec<_> = (1..=7).map(|n| hours(CampaignType::Nurture, n)).collect();
        assert_eq!(nurture, vec![0, 24, 72, 120, 168, 240, 336]);
        let no_show: Vec<_> = (1..=4).map(|n| hours(CampaignType::NoShow, n)).collect();
        assert_eq!(no_show, vec![0, 4, 24, 72]);
        let post_call: Vec<_> = (1..=5).map(|n| hours(CampaignType::PostCall, n)).collect();
        assert_eq!(post_call, vec![0, 24, 72, 168, 336]);
        let onboarding: Vec<_> = (1..=6).map(|n| hours(CampaignType::Onboarding, n)).collect();
        assert_eq!(onboarding, vec![0, 24, 72, 168, 336, 720]);
    }

    #[test]
    fn test_accelerated_reads_minutes() {
        let calc = DelayCalculator::new(DelayMode::Accelerated);
        assert_eq!(
            calc.delay_for(CampaignType::Nurture, 2).unwrap(),
            Duration::minutes(24)
        );
        assert_eq!(
            calc.delay_for(CampaignType::Onboarding, 6).unwrap(),
            Duration::minutes(720)
        );
    }

    #[test]
    fn test_delays_strictly_increase() {
        for mode in MODES {
            let calc = DelayCalculator::new(mode);
            for campaign in CampaignType::ALL {
                let n = catalog::definition(campaign).len() as u32;
                for step in 2..=n {
                    assert!(
                        calc.delay_for(campaign, step).unwrap()
                            > calc.delay_for(campaign, step - 1).unwrap(),
                        "{campaign} step {step} in {mode:?}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_accelerated_shorter_after_first_step() {
        let prod = DelayCalculator::new(DelayMode::Production);
        let fast = DelayCalculator::new(DelayMode::Accelerated);
        for campaign in CampaignType::ALL {
            let n = catalog::definition(campaign).len() as u32;
            for step in 2..=n {
                assert!(
                    fast.delay_for(campaign, step).unwrap() < prod.delay_for(campaign, step).unwrap()
                );
            }
        }
    }

    #[test]
    fn test_invalid_steps() {
        let calc = DelayCalculator::default();
        for campaign in CampaignType::ALL {
            let n = catalog::definition(campaign).len() as u32;
            assert!(matches!(
                calc.delay_for(campaign, 0),
                Err(OutreachError::InvalidStep { .. })
            ));
            assert!(matches!(
                calc.delay_for(campaign, n + 1),
                Err(OutreachError::InvalidStep { .. })
            ));
        }
    }

    #[test]
    fn test_fire_time_is_trigger_plus_delay() {
        let trigger = Utc::now();
        let calc = DelayCalculator::new(DelayMode::Production);
        assert_eq!(
            calc.fire_time(CampaignType::NoShow, 2, trigger).unwrap(),
            trigger + Duration::hours(4)
        );
    }
}
