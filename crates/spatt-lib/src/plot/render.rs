use super::{cell_edges, Color as FigColor, Figure, HeatmapSeries, Series};
use anyhow::Result;
use plotters::coord::Shift;
use plotters::prelude::*;

pub const DEFAULT_SIZE: (u32, u32) = (800, 480);

fn rgb(color: FigColor) -> RGBColor {
    let (r, g, b) = color.rgb();
    RGBColor(r, g, b)
}

/// Blue-white-red map of `v` in `[-1, 1]`.
fn diverging(v: f64) -> RGBColor {
    if !v.is_finite() {
        return RGBColor(0xBB, 0xBB, 0xBB);
    }
    let v = v.clamp(-1.0, 1.0);
    let (end, t) = if v < 0.0 {
        ((0x21, 0x66, 0xAC), -v)
    } else {
        ((0xB2, 0x18, 0x2B), v)
    };
    let lerp = |c: u8| (255.0 + (c as f64 - 255.0) * t).round() as u8;
    RGBColor(lerp(end.0), lerp(end.1), lerp(end.2))
}

fn heatmap_limit(map: &HeatmapSeries) -> f64 {
    let lim = map.vlim.unwrap_or_else(|| {
        map.values
            .iter()
            .flatten()
            .filter(|v| v.is_finite())
            .fold(0.0f64, |acc, v| acc.max(v.abs()))
    });
    if lim > 0.0 {
        lim
    } else {
        1.0
    }
}

fn padded(range: [f64; 2]) -> std::ops::Range<f64> {
    let span = range[1] - range[0];
    if span.abs() < f64::EPSILON {
        let pad = range[0].abs().max(1.0) * 0.05;
        (range[0] - pad)..(range[1] + pad)
    } else {
        range[0]..range[1]
    }
}

fn log_y(fig: &Figure, y: f64) -> f64 {
    if fig.y.log {
        y.max(f64::MIN_POSITIVE).log10()
    } else {
        y
    }
}

/// Draw `fig` into an SVG document.
pub fn render_svg(fig: &Figure, size: (u32, u32)) -> Result<String> {
    let mut svg = String::new();
    {
        let root = SVGBackend::with_string(&mut svg, size).into_drawing_area();
        root.fill(&WHITE)?;
        draw_figure(&root, fig)?;
        root.present()?;
    }
    Ok(svg)
}

fn draw_figure(root: &DrawingArea<SVGBackend, Shift>, fig: &Figure) -> Result<()> {
    let (xs, ys) = fig.bounds().unwrap_or(([0.0, 1.0], [0.0, 1.0]));
    let ys = [log_y(fig, ys[0]), log_y(fig, ys[1])];
    let is_bars = fig.series.iter().any(|s| matches!(s, Series::Bars(_)));
    let bar_labels: Vec<String> = fig
        .series
        .iter()
        .find_map(|s| match s {
            Series::Bars(bars) => Some(bars.labels.clone()),
            _ => None,
        })
        .unwrap_or_default();
    let y_range = if is_bars {
        padded([ys[0].min(0.0), ys[1] * 1.1])
    } else {
        padded(ys)
    };

    let mut chart = ChartBuilder::on(root)
        .margin(10)
        .caption(
            fig.title.clone().unwrap_or_else(|| "Plot".into()),
            ("sans-serif", 22),
        )
        .x_label_area_size(40)
        .y_label_area_size(60)
        .build_cartesian_2d(padded(xs), y_range.clone())?;

    let x_desc = fig.x.label.clone().unwrap_or_default();
    let y_desc = match (&fig.y.label, fig.y.log) {
        (Some(label), true) => format!("log10 {}", label),
        (Some(label), false) => label.clone(),
        (None, _) => String::new(),
    };
    let bar_formatter = |x: &f64| {
        let i = x.round();
        if (x - i).abs() < 1e-6 && i >= 0.0 {
            bar_labels.get(i as usize).cloned().unwrap_or_default()
        } else {
            String::new()
        }
    };
    {
        let mut mesh = chart.configure_mesh();
        mesh.x_desc(x_desc).y_desc(y_desc);
        if is_bars {
            mesh.x_labels(bar_labels.len().max(1) * 2 + 1)
                .x_label_formatter(&bar_formatter)
                .disable_x_mesh();
        }
        mesh.draw()?;
    }

    for span in &fig.spans {
        chart.draw_series(std::iter::once(Rectangle::new(
            [(span.start, y_range.start), (span.end, y_range.end)],
            rgb(span.color).mix(0.2).filled(),
        )))?;
    }

    let mut legend = false;
    for series in &fig.series {
        match series {
            Series::Line(line) => {
                let color = rgb(line.style.color);
                let drawn = chart.draw_series(plotters::series::LineSeries::new(
                    line.points.iter().map(|p| (p[0], log_y(fig, p[1]))),
                    color.stroke_width(line.style.width.round().max(1.0) as u32),
                ))?;
                if !line.name.is_empty() {
                    drawn
                        .label(line.name.clone())
                        .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], color));
                    legend = true;
                }
            }
            Series::Band(band) => {
                let mut outline: Vec<(f64, f64)> = band
                    .x
                    .iter()
                    .zip(band.upper.iter())
                    .map(|(&x, &y)| (x, log_y(fig, y)))
                    .collect();
                outline.extend(
                    band.x
                        .iter()
                        .zip(band.lower.iter())
                        .rev()
                        .map(|(&x, &y)| (x, log_y(fig, y))),
                );
                chart.draw_series(std::iter::once(Polygon::new(
                    outline,
                    rgb(band.color).mix(0.25).filled(),
                )))?;
            }
            Series::Bars(bars) => {
                let color = rgb(bars.color);
                chart.draw_series(bars.values.iter().enumerate().map(|(i, &v)| {
                    let x = i as f64;
                    Rectangle::new([(x - 0.4, 0.0), (x + 0.4, v)], color.filled())
                }))?;
            }
            Series::Heatmap(map) => {
                let lim = heatmap_limit(map);
                let (x_lo, x_hi) = cell_edges(&map.x);
                let (y_lo, y_hi) = cell_edges(&map.y);
                let edges = |centers: &[f64], lo: f64, hi: f64| -> Vec<f64> {
                    let mut out = Vec::with_capacity(centers.len() + 1);
                    out.push(lo);
                    out.extend(centers.windows(2).map(|w| (w[0] + w[1]) / 2.0));
                    out.push(hi);
                    out
                };
                let x_edges = edges(&map.x, x_lo, x_hi);
                let y_edges = edges(&map.y, y_lo, y_hi);
                let (xe, ye) = (&x_edges, &y_edges);
                chart.draw_series(map.values.iter().enumerate().flat_map(move |(r, row)| {
                    row.iter().enumerate().map(move |(c, &v)| {
                        Rectangle::new(
                            [(xe[c], ye[r]), (xe[c + 1], ye[r + 1])],
                            diverging(v / lim).filled(),
                        )
                    })
                }))?;
            }
        }
    }

    if legend && fig.series.len() > 1 {
        chart
            .configure_series_labels()
            .background_style(WHITE.mix(0.8))
            .border_style(BLACK)
            .draw()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plot::{BarSeries, LineSeries, Style};

    #[test]
    fn colormap_endpoints() {
        assert_eq!(diverging(0.0), RGBColor(255, 255, 255));
        assert_eq!(diverging(-1.0), RGBColor(0x21, 0x66, 0xAC));
        assert_eq!(diverging(2.0), RGBColor(0xB2, 0x18, 0x2B));
        assert_eq!(diverging(f64::NAN), RGBColor(0xBB, 0xBB, 0xBB));
    }

    #[test]
    fn degenerate_ranges_are_widened() {
        let r = padded([2.0, 2.0]);
        assert!(r.start < 2.0 && r.end > 2.0);
        assert_eq!(padded([0.0, 1.0]), 0.0..1.0);
    }

    #[test]
    fn renders_line_and_bar_figures() {
        let mut fig = Figure::new(Some("alpha".to_string())).with_labels("Hz", "power");
        fig.add_series(Series::Line(LineSeries {
            name: "PO4".into(),
            points: (0..20).map(|i| [i as f64, (i as f64).sin()]).collect(),
            style: Style { width: 1.5, color: FigColor(0x1F77B4) },
        }));
        fig.add_span(8.0, 12.0, FigColor(0xFFD54F));
        let svg = render_svg(&fig, DEFAULT_SIZE).unwrap();
        assert!(svg.contains("<svg"));

        let mut bars = Figure::new(Some("drops".to_string()));
        bars.add_series(Series::Bars(BarSeries {
            labels: vec!["NO_DATA".into(), "Fp1".into()],
            values: vec![2.0, 5.0],
            color: FigColor(0xD62728),
        }));
        assert!(render_svg(&bars, DEFAULT_SIZE).unwrap().contains("<svg"));
    }
}
