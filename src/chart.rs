//! Bar charts rendered to SVG in memory

use plotters::prelude::*;

use crate::config::ChartConfig;
use crate::error::{BanwatchError, Result};
use crate::models::CountryTally;
use crate::notify::RenderedImage;
use crate::period::{Bucket, Granularity, Period, PeriodStats};

const BAR: RGBColor = RGBColor(70, 130, 180);
const PREVIOUS: RGBColor = RGBColor(160, 160, 160);
const UNKNOWN: RGBColor = RGBColor(200, 200, 200);

pub trait ChartRenderer: Send + Sync {
    /// Bans per country, largest first
    fn countries(&self, tally: &CountryTally, title: &str) -> Result<RenderedImage>;

    /// Previous period next to the current one
    fn comparison(&self, stats: &PeriodStats) -> Result<RenderedImage>;

    /// Bans per sub-interval of one period
    fn breakdown(&self, period: &Period, buckets: &[Bucket]) -> Result<RenderedImage>;
}

pub struct SvgChartRenderer {
    width: u32,
    height: u32,
    legend_items: usize,
}

struct Bar {
    label: String,
    value: u64,
    color: RGBColor,
}

impl SvgChartRenderer {
    pub fn new(config: &ChartConfig) -> Self {
        Self {
            width: config.width.max(200),
            height: config.height.max(150),
            legend_items: config.legend_items.max(1),
        }
    }

    fn draw(&self, title: &str, y_desc: &str, bars: &[Bar]) -> Result<String> {
        let mut svg = String::new();
        {
            let root = SVGBackend::with_string(&mut svg, (self.width, self.height)).into_drawing_area();
            root.fill(&WHITE).map_err(render_error)?;

            let n = bars.len().max(1) as i32;
            let top = bars.iter().map(|b| b.value).max().unwrap_or(0);
            let y_max = (top + top / 10).max(1) + 1;

            let mut chart = ChartBuilder::on(&root)
                .caption(title, ("sans-serif", 24).into_font())
                .margin(20)
                .x_label_area_size(50)
                .y_label_area_size(60)
                .build_cartesian_2d((0..n).into_segmented(), 0u64..y_max)
                .map_err(render_error)?;

            let label_for = |v: &SegmentValue<i32>| match v {
                SegmentValue::CenterOf(i) => bars
                    .get(*i as usize)
                    .map(|b| b.label.clone())
                    .unwrap_or_default(),
                _ => String::new(),
            };

            chart
                .configure_mesh()
                .disable_x_mesh()
                .x_labels(bars.len().max(1))
                .x_label_formatter(&label_for)
                .y_desc(y_desc)
                .draw()
                .map_err(render_error)?;

            chart
                .draw_series(bars.iter().enumerate().map(|(i, bar)| {
                    let i = i as i32;
                    let mut rect = Rectangle::new(
                        [
                            (SegmentValue::Exact(i), 0),
                            (SegmentValue::Exact(i + 1), bar.value),
                        ],
                        bar.color.filled(),
                    );
                    rect.set_margin(0, 0, 4, 4);
                    rect
                }))
                .map_err(render_error)?;

            root.present().map_err(render_error)?;
        }
        Ok(svg)
    }
}

impl ChartRenderer for SvgChartRenderer {
    fn countries(&self, tally: &CountryTally, title: &str) -> Result<RenderedImage> {
        let top = tally.top(self.legend_items);
        let shown: u64 = top.iter().map(|(_, c)| c.count).sum();

        let mut bars: Vec<Bar> = top
            .into_iter()
            .enumerate()
            .map(|(i, (code, c))| {
                let (r, g, b) = Palette99::pick(i).rgb();
                Bar {
                    label: code,
                    value: c.count,
                    color: RGBColor(r, g, b),
                }
            })
            .collect();

        let other = tally.known() - shown;
        if other > 0 {
            bars.push(Bar {
                label: "Other".into(),
                value: other,
                color: PREVIOUS,
            });
        }
        if tally.unknown > 0 {
            bars.push(Bar {
                label: "Unknown".into(),
                value: tally.unknown,
                color: UNKNOWN,
            });
        }

        let svg = self.draw(title, "Bans", &bars)?;
        Ok(svg_image("geo", svg))
    }

    fn comparison(&self, stats: &PeriodStats) -> Result<RenderedImage> {
        let g = stats.period.granularity;
        let bars = [
            Bar {
                label: format!("Previous {}", g.as_str()),
                value: stats.previous_count,
                color: PREVIOUS,
            },
            Bar {
                label: format!("Current {}", g.as_str()),
                value: stats.count,
                color: BAR,
            },
        ];

        let title = format!("Bans: {} vs previous {}", g.label(), g.as_str());
        let svg = self.draw(&title, "Bans", &bars)?;
        Ok(svg_image(&format!("compare_{}", g.as_str()), svg))
    }

    fn breakdown(&self, period: &Period, buckets: &[Bucket]) -> Result<RenderedImage> {
        let pattern = bucket_label_pattern(period.granularity);
        let bars: Vec<Bar> = buckets
            .iter()
            .map(|b| Bar {
                label: b.start.format(pattern).to_string(),
                value: b.count,
                color: BAR,
            })
            .collect();

        let title = format!("Bans per {} ({} UTC)", bucket_unit(period.granularity), period);
        let svg = self.draw(&title, "Bans", &bars)?;
        Ok(svg_image(&format!("stats_{}", period.granularity.as_str()), svg))
    }
}

fn bucket_label_pattern(granularity: Granularity) -> &'static str {
    match granularity {
        Granularity::Hour => "%H:%M",
        Granularity::Day => "%H",
        Granularity::Week => "%a",
        Granularity::Month => "%d",
        Granularity::Year => "%b",
    }
}

fn bucket_unit(granularity: Granularity) -> &'static str {
    match granularity {
        Granularity::Hour => "5 minutes",
        Granularity::Day => "hour",
        Granularity::Week | Granularity::Month => "day",
        Granularity::Year => "month",
    }
}

fn svg_image(stem: &str, svg: String) -> RenderedImage {
    RenderedImage {
        file_name: format!("{}.svg", stem),
        mime: "image/svg+xml",
        bytes: svg.into_bytes(),
    }
}

fn render_error<E: std::fmt::Display>(e: E) -> BanwatchError {
    BanwatchError::Render(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::GeoLookup;
    use crate::period::bucket_counts;
    use chrono::{TimeZone, Utc};

    fn renderer() -> SvgChartRenderer {
        SvgChartRenderer::new(&ChartConfig {
            legend_items: 2,
            width: 800,
            height: 500,
        })
    }

    fn as_text(image: &RenderedImage) -> String {
        String::from_utf8(image.bytes.clone()).unwrap()
    }

    #[test]
    fn test_country_chart() {
        let mut tally = CountryTally::new();
        for (code, name, n) in [("CN", "China", 5), ("US", "United States", 3), ("DE", "Germany", 1)] {
            for _ in 0..n {
                tally.add(&GeoLookup::Country {
                    code: code.into(),
                    name: name.into(),
                });
            }
        }
        tally.add(&GeoLookup::Unknown);

        let image = renderer().countries(&tally, "All time").unwrap();
        assert_eq!(image.mime, "image/svg+xml");
        assert_eq!(image.file_name, "geo.svg");

        let svg = as_text(&image);
        assert!(svg.starts_with("<svg"));
        assert!(svg.contains("CN"));
        assert!(svg.contains("Other"));
        assert!(svg.contains("Unknown"));
    }

    #[test]
    fn test_empty_chart_renders() {
        let image = renderer().countries(&CountryTally::new(), "Nothing").unwrap();
        assert!(as_text(&image).contains("</svg>"));
    }

    #[test]
    fn test_comparison_and_breakdown() {
        let reference = Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap();
        let period = Period::containing(Granularity::Week, reference).unwrap();
        let stats = PeriodStats {
            period,
            previous: period.previous().unwrap(),
            count: 7,
            previous_count: 3,
        };
        let image = renderer().comparison(&stats).unwrap();
        assert_eq!(image.file_name, "compare_week.svg");
        assert!(as_text(&image).contains("Current week"));

        let buckets = bucket_counts(vec![reference], &stats.period);
        let image = renderer().breakdown(&stats.period, &buckets).unwrap();
        let svg = as_text(&image);
        assert!(svg.contains("Fri"));
        assert!(svg.contains("Bans per day"));
    }
}
