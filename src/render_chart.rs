use crate::overlay::MarkerState;
use crate::trace_store::{CellId, TraceSet};
use svg::Document;
use svg::node::element::{Line, Polyline, Rectangle, Text};

const SVG_WIDTH: f64 = 720.0;
const SVG_HEIGHT: f64 = 360.0;
const PLOT_LEFT: f64 = 64.0;
const PLOT_RIGHT: f64 = SVG_WIDTH - 20.0;
const PLOT_TOP: f64 = 20.0;
const PLOT_BOTTOM: f64 = SVG_HEIGHT - 44.0;

const SERIES_COLORS: [&str; 10] = [
    "#1f77b4", "#2ca02c", "#9467bd", "#8c564b", "#17becf", "#e377c2", "#7f7f7f", "#bcbd22",
    "#393b79", "#637939",
];

#[derive(Debug, Clone, PartialEq)]
pub struct ChartSeries {
    pub cell_id: CellId,
    pub state: MarkerState,
    /// `(frame, value)` in frame order.
    pub points: Vec<(usize, f64)>,
}

/// One series per listed cell that exists in the store, in list order.
pub fn page_series(traces: &TraceSet, cells: &[CellId], selected: Option<CellId>) -> Vec<ChartSeries> {
    cells
        .iter()
        .filter_map(|cell_id| {
            let trace = traces.get(cell_id)?;
            Some(ChartSeries {
                cell_id: *cell_id,
                state: MarkerState::resolve(trace.is_good(), selected == Some(*cell_id)),
                points: trace.points().collect(),
            })
        })
        .collect()
}

#[derive(Debug, Clone, Copy)]
struct Bounds {
    frame_min: f64,
    frame_max: f64,
    value_min: f64,
    value_max: f64,
}

impl Bounds {
    fn of(series: &[ChartSeries]) -> Option<Self> {
        let mut points = series.iter().flat_map(|s| s.points.iter());
        let &(f0, v0) = points.next()?;
        let mut b = Self {
            frame_min: f0 as f64,
            frame_max: f0 as f64,
            value_min: v0,
            value_max: v0,
        };
        for &(f, v) in points {
            b.frame_min = b.frame_min.min(f as f64);
            b.frame_max = b.frame_max.max(f as f64);
            b.value_min = b.value_min.min(v);
            b.value_max = b.value_max.max(v);
        }
        if b.frame_max <= b.frame_min {
            b.frame_max = b.frame_min + 1.0;
        }
        if b.value_max <= b.value_min {
            b.value_min -= 0.5;
            b.value_max += 0.5;
        }
        Some(b)
    }

    fn x(&self, frame: f64) -> f64 {
        PLOT_LEFT + (frame - self.frame_min) / (self.frame_max - self.frame_min) * (PLOT_RIGHT - PLOT_LEFT)
    }

    fn y(&self, value: f64) -> f64 {
        PLOT_BOTTOM - (value - self.value_min) / (self.value_max - self.value_min) * (PLOT_BOTTOM - PLOT_TOP)
    }
}

fn label(text: String, x: f64, y: f64, anchor: &str) -> Text {
    Text::new(text)
        .set("x", x)
        .set("y", y)
        .set("text-anchor", anchor)
        .set("font-family", "monospace")
        .set("font-size", 11)
        .set("fill", "#374151")
}

/// Line chart of value over frame for the given series. Excluded cells are
/// dashed gray, the selected cell is drawn last and thicker.
pub fn render_chart_svg(series: &[ChartSeries], current_frame: Option<usize>) -> String {
    let mut doc = Document::new()
        .set("viewBox", (0, 0, SVG_WIDTH, SVG_HEIGHT))
        .set("width", SVG_WIDTH)
        .set("height", SVG_HEIGHT)
        .add(
            Rectangle::new()
                .set("x", 0)
                .set("y", 0)
                .set("width", SVG_WIDTH)
                .set("height", SVG_HEIGHT)
                .set("fill", "#ffffff"),
        );

    let Some(bounds) = Bounds::of(series) else {
        return doc
            .add(label(
                "No traces on this page".to_string(),
                SVG_WIDTH / 2.0,
                SVG_HEIGHT / 2.0,
                "middle",
            ))
            .to_string();
    };

    doc = doc
        .add(
            Line::new()
                .set("x1", PLOT_LEFT)
                .set("y1", PLOT_BOTTOM)
                .set("x2", PLOT_RIGHT)
                .set("y2", PLOT_BOTTOM)
                .set("stroke", "#9ca3af")
                .set("stroke-width", 1),
        )
        .add(
            Line::new()
                .set("x1", PLOT_LEFT)
                .set("y1", PLOT_TOP)
                .set("x2", PLOT_LEFT)
                .set("y2", PLOT_BOTTOM)
                .set("stroke", "#9ca3af")
                .set("stroke-width", 1),
        )
        .add(label(
            format!("{}", bounds.frame_min),
            PLOT_LEFT,
            PLOT_BOTTOM + 16.0,
            "middle",
        ))
        .add(label(
            format!("{}", bounds.frame_max),
            PLOT_RIGHT,
            PLOT_BOTTOM + 16.0,
            "middle",
        ))
        .add(label(
            "frame".to_string(),
            (PLOT_LEFT + PLOT_RIGHT) / 2.0,
            SVG_HEIGHT - 8.0,
            "middle",
        ))
        .add(label(
            format!("{:.3}", bounds.value_max),
            PLOT_LEFT - 6.0,
            PLOT_TOP + 4.0,
            "end",
        ))
        .add(label(
            format!("{:.3}", bounds.value_min),
            PLOT_LEFT - 6.0,
            PLOT_BOTTOM,
            "end",
        ));

    if let Some(frame) = current_frame {
        let frame = frame as f64;
        if frame >= bounds.frame_min && frame <= bounds.frame_max {
            let x = bounds.x(frame);
            doc = doc.add(
                Line::new()
                    .set("x1", x)
                    .set("y1", PLOT_TOP)
                    .set("x2", x)
                    .set("y2", PLOT_BOTTOM)
                    .set("stroke", "#f59e0b")
                    .set("stroke-width", 1)
                    .set("stroke-dasharray", "3 3"),
            );
        }
    }

    let mut ordered: Vec<(usize, &ChartSeries)> = series.iter().enumerate().collect();
    ordered.sort_by_key(|(_, s)| s.state == MarkerState::Active);
    for (idx, s) in ordered {
        let points = s
            .points
            .iter()
            .map(|&(f, v)| format!("{:.2},{:.2}", bounds.x(f as f64), bounds.y(v)))
            .collect::<Vec<_>>()
            .join(" ");
        let mut line = Polyline::new()
            .set("points", points)
            .set("fill", "none")
            .set("data-cell", s.cell_id.to_string());
        line = match s.state {
            MarkerState::Neutral => line
                .set("stroke", SERIES_COLORS[idx % SERIES_COLORS.len()])
                .set("stroke-width", 1.2),
            MarkerState::Active => line.set("stroke", "#f59e0b").set("stroke-width", 2.6),
            MarkerState::Excluded => line
                .set("stroke", "#d1d5db")
                .set("stroke-width", 1)
                .set("stroke-dasharray", "4 3"),
        };
        doc = doc.add(line);
    }

    doc.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn traces() -> TraceSet {
        let csv = "fov,cell,frame,value,good\n\
                   0,1,0,1.0,true\n0,1,1,2.0,true\n\
                   0,2,0,3.0,false\n0,2,1,4.0,false\n\
                   0,3,0,5.0,true\n";
        TraceSet::load(csv).unwrap().0
    }

    #[test]
    fn test_page_series_states() {
        let traces = traces();
        let cells = vec![CellId::new(0, 1), CellId::new(0, 2), CellId::new(0, 9)];
        let series = page_series(&traces, &cells, Some(CellId::new(0, 1)));
        assert_eq!(series.len(), 2);
        assert_eq!(series[0].state, MarkerState::Active);
        assert_eq!(series[0].points, vec![(0, 1.0), (1, 2.0)]);
        assert_eq!(series[1].state, MarkerState::Excluded);
    }

    #[test]
    fn test_chart_has_one_polyline_per_series() {
        let traces = traces();
        let cells: Vec<CellId> = traces.cell_ids().collect();
        let series = page_series(&traces, &cells, None);
        let svg = render_chart_svg(&series, Some(1));
        assert_eq!(svg.matches("<polyline").count(), 3);
        assert!(svg.contains("stroke-dasharray=\"4 3\""));
        assert!(svg.contains("data-cell=\"0:2\""));
    }

    #[test]
    fn test_empty_chart_has_placeholder() {
        let svg = render_chart_svg(&[], None);
        assert!(svg.contains("No traces on this page"));
        assert!(!svg.contains("<polyline"));
    }
}
