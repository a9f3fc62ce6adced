use std::ffi::c_void;

/// Source of call stacks for new samples.
///
/// Implementations may allocate: they are only ever invoked while the
/// calling thread holds a [`ReentrancyGuard`](crate::guard::ReentrancyGuard).
pub trait StackCapture: Send + Sync {
    /// Return addresses of the calling thread, innermost first, after
    /// dropping `skip` leading frames and keeping at most `max_depth`.
    fn capture(&self, skip: usize, max_depth: usize) -> Vec<usize>;
}

impl<F> StackCapture for F
where
    F: Fn(usize, usize) -> Vec<usize> + Send + Sync,
{
    fn capture(&self, skip: usize, max_depth: usize) -> Vec<usize> {
        self(skip, max_depth)
    }
}

/// Unresolved native stack walk via the `backtrace` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct BacktraceCapture;

impl StackCapture for BacktraceCapture {
    fn capture(&self, skip: usize, max_depth: usize) -> Vec<usize> {
        let mut frames = Vec::with_capacity(max_depth);
        let mut remaining_skip = skip;

        backtrace::trace(|frame| {
            if remaining_skip > 0 {
                remaining_skip -= 1;
                return true;
            }
            if frames.len() >= max_depth {
                return false;
            }
            frames.push(frame.ip() as usize);
            true
        });

        frames
    }
}

/// Resolve raw frame addresses to readable `function (file:line)` strings.
///
/// Inlined functions expand to several entries. Frames without symbols are
/// rendered as hex addresses.
pub fn symbolize(stack: &[usize]) -> Vec<String> {
    let mut resolved = Vec::with_capacity(stack.len());

    for &address in stack {
        let mut found = false;
        backtrace::resolve(address as *mut c_void, |symbol| {
            let Some(name) = symbol.name() else {
                return;
            };
            found = true;
            let clean_name = clean_symbol_name(&name.to_string());

            let location = if let (Some(file), Some(line)) = (symbol.filename(), symbol.lineno()) {
                format!("{} ({}:{})", clean_name, file.display(), line)
            } else {
                clean_name
            };
            resolved.push(location);
        });

        if !found {
            resolved.push(format!("{:#x}", address));
        }
    }

    resolved
}

fn clean_symbol_name(name: &str) -> String {
    // Remove hash suffixes like ::h1a2b3c4d5e6f7g8
    if let Some(pos) = name.rfind("::h") {
        let hash = &name[pos + 3..];
        if !hash.is_empty() && hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return name[..pos].to_string();
        }
    }
    name.to_string()
}
