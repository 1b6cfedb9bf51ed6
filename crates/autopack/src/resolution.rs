use serde::{Deserialize, Serialize};

/// One rung of the rendition ladder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub name: String,
    pub w: u32,
    pub h: u32,
}

/// Named tiers, largest first
const NAMED_RESOLUTIONS: &[(&str, u32, u32)] = &[
    ("4k", 3840, 2160),
    ("1440p", 2560, 1440),
    ("1080p", 1920, 1080),
    ("720p", 1280, 720),
];

pub const NATIVE: &str = "native";

/// Round to nearest, then clear the low bit so encoders get even dimensions
fn round_even(x: f64) -> u32 {
    (x.round() as u32) & !1
}

/// Build the rendition ladder for a source of `width`x`height`.
///
/// The first entry is always the native size. Sources at least as wide as 16:9 are
/// scaled by width, narrower ones by height. A tier is only added when its reference
/// dimension is strictly smaller than the native one, so a 1920x1080 source gets
/// `native` but no `1080p`.
pub fn plan_ladder(width: u32, height: u32) -> Vec<Resolution> {
    let mut ladder = vec![Resolution {
        name: NATIVE.to_string(),
        w: width,
        h: height,
    }];

    // w/h >= 16/9 without floating point
    let by_width = u64::from(width) * 9 >= u64::from(height) * 16;

    for &(name, tier_w, tier_h) in NAMED_RESOLUTIONS {
        if by_width {
            if tier_w < width {
                ladder.push(Resolution {
                    name: name.to_string(),
                    w: tier_w,
                    h: round_even(f64::from(tier_w) / f64::from(width) * f64::from(height)),
                });
            }
        } else if tier_h < height {
            ladder.push(Resolution {
                name: name.to_string(),
                w: round_even(f64::from(tier_h) / f64::from(height) * f64::from(width)),
                h: tier_h,
            });
        }
    }

    ladder
}

/// Pick the rung for the fallback encode: `preferred`, else native, else the first rung
pub fn fallback_resolution<'a>(ladder: &'a [Resolution], preferred: &str) -> Option<&'a Resolution> {
    ladder
        .iter()
        .find(|r| r.name == preferred)
        .or_else(|| ladder.iter().find(|r| r.name == NATIVE))
        .or_else(|| ladder.first())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn names(ladder: &[Resolution]) -> Vec<&str> {
        ladder.iter().map(|r| r.name.as_str()).collect()
    }

    #[test]
    fn test_exact_1080p_does_not_repeat_tier() {
        let ladder = plan_ladder(1920, 1080);
        assert_eq!(names(&ladder), vec!["native", "720p"]);
        assert_eq!(ladder[1], Resolution { name: "720p".into(), w: 1280, h: 720 });
    }

    #[test]
    fn test_4k_source() {
        let ladder = plan_ladder(3840, 2160);
        assert_eq!(names(&ladder), vec!["native", "1440p", "1080p", "720p"]);
    }

    #[test]
    fn test_ultrawide_scales_by_width() {
        // 2.4:1 scope
        let ladder = plan_ladder(1920, 800);
        assert_eq!(names(&ladder), vec!["native", "720p"]);
        assert_eq!(ladder[1].w, 1280);
        assert_eq!(ladder[1].h, 532); // 533.33 -> 533 -> even
    }

    #[test]
    fn test_4_3_scales_by_height() {
        let ladder = plan_ladder(1440, 1080);
        assert_eq!(names(&ladder), vec!["native", "720p"]);
        assert_eq!(ladder[1], Resolution { name: "720p".into(), w: 960, h: 720 });
    }

    #[test]
    fn test_small_source_is_native_only() {
        let ladder = plan_ladder(640, 480);
        assert_eq!(names(&ladder), vec!["native"]);
    }

    #[test]
    fn test_fallback_prefers_720p_then_native() {
        let ladder = plan_ladder(3840, 2160);
        assert_eq!(fallback_resolution(&ladder, "720p").unwrap().name, "720p");

        let small = plan_ladder(640, 480);
        assert_eq!(fallback_resolution(&small, "720p").unwrap().name, "native");

        assert!(fallback_resolution(&[], "720p").is_none());
    }

    proptest! {
        /// Every non-native rung is strictly smaller on the governing axis, and every
        /// derived rung is even in both dimensions
        #[test]
        fn test_ladder_shrinks_on_governing_axis(w in 2u32..8000, h in 2u32..8000) {
            let ladder = plan_ladder(w, h);
            prop_assert_eq!(&ladder[0].name, "native");
            let by_width = u64::from(w) * 9 >= u64::from(h) * 16;

            for r in &ladder[1..] {
                if by_width {
                    prop_assert!(r.w < w);
                } else {
                    prop_assert!(r.h < h);
                }
                prop_assert_eq!(r.w % 2, 0);
                prop_assert_eq!(r.h % 2, 0);
            }
        }

        #[test]
        fn test_ladder_is_deterministic(w in 2u32..8000, h in 2u32..8000) {
            prop_assert_eq!(plan_ladder(w, h), plan_ladder(w, h));
        }
    }
}
